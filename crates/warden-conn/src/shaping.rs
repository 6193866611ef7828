use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
#[error("traffic shaping forced the connection to close")]
pub struct ForceCloseError;

pub fn force_close_error() -> io::Error {
    io::Error::other(ForceCloseError)
}

pub fn is_force_close(error: &io::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = error.get_ref().map(|e| e as _);
    while let Some(current) = source {
        if current.is::<ForceCloseError>() {
            return true;
        }
        source = current.source();
    }
    false
}
