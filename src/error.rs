// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::collections::TryReserveError;
use std::io;

use thiserror::Error;

use crate::runner::{RunId, RunState};

#[derive(Error, Debug)]
pub enum ErrorKind {
    #[error("io error")]
    IoError(#[from] io::Error),
    #[error("nix error")]
    NixError(#[from] nix::Error),
    #[error("json error")]
    JsonError(#[from] serde_json::Error),
    #[error("out of memory")]
    OutOfMemory(#[from] TryReserveError),
    #[error("runner limit of {0} reached")]
    ResourceExhausted(usize),
    #[error("no runner with id {0}")]
    NotFound(RunId),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("runner {run_id} is {state:?}, request denied")]
    PermissionDenied { run_id: RunId, state: RunState },
    #[error("failed to launch {app}")]
    LaunchFailed {
        app: String,
        #[source]
        source: Box<Error>,
    },
    #[error("an error occured: {0}")]
    ErrorMsg(String),
    #[error("an error occured: {0}")]
    ErrorStr(&'static str),
}

#[derive(Error, Debug)]
#[error(transparent)]
pub struct Error(ErrorKind);

impl Error {
    fn from_kind(kind: ErrorKind) -> Self {
        Self(kind)
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.0
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::from_kind(ErrorKind::InvalidArgument(msg.into()))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.0, ErrorKind::NotFound(_))
    }
}

impl<E> From<E> for Error
where
    E: Into<ErrorKind>,
{
    fn from(err: E) -> Self {
        Self::from_kind(err.into())
    }
}

impl From<&'static str> for Error {
    fn from(err: &'static str) -> Self {
        Self::from_kind(ErrorKind::ErrorStr(err))
    }
}

impl From<String> for Error {
    fn from(err: String) -> Self {
        Self::from_kind(ErrorKind::ErrorMsg(err))
    }
}
