use std::io;

use thiserror::Error;

use crate::control::ControlError;
use crate::listener::ListenerError;
use crate::pidfile::LockError;
use crate::reload::ReloadError;
use crate::spawn::SpawnError;

/// Any failure surfaced by the lifecycle API.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error(transparent)]
    Reload(#[from] ReloadError),

    #[error(transparent)]
    Control(#[from] ControlError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
