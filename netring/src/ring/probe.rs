// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Opcode probing at ring initialization.

use log::*;

use std::io;

use io_uring::{opcode, Probe, Submitter};

use crate::Error;

/// The opcodes the driver cannot run without.
const REQUIRED: &[(u8, &str)] = &[
    (opcode::Accept::CODE, "accept"),
    (opcode::Recv::CODE, "recv"),
    (opcode::RecvMsg::CODE, "recvmsg"),
    (opcode::Send::CODE, "send"),
    (opcode::SendMsg::CODE, "sendmsg"),
    (opcode::Close::CODE, "close"),
    (opcode::Connect::CODE, "connect"),
];

/// Asks the kernel which opcodes it supports and verifies that every
/// required one is present.
pub(crate) fn verify_required_opcodes(submitter: &Submitter<'_>) -> Result<(), Error> {
    let mut probe = Probe::new();
    if let Err(e) = submitter.register_probe(&mut probe) {
        error!("failed to probe io_uring features: {e}");
        return Err(Error::KernelUnsupported(e));
    }

    for (code, name) in REQUIRED {
        if !probe.is_supported(*code) {
            error!(
                "io_uring opcode {name} is not supported here\n\
                 NB: this requires a kernel version >= 6.0"
            );
            return Err(Error::KernelUnsupported(io::Error::from_raw_os_error(
                libc::EOPNOTSUPP,
            )));
        }
        trace!("io_uring opcode {name} supported");
    }
    Ok(())
}
