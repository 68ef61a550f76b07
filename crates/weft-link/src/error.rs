//! Link error types

use thiserror::Error;

use weft_core::WireError;

/// Errors from sending on or reading from a neighbor link
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("Link closed")]
    Closed,

    #[error("Framing error: {0}")]
    Frame(#[from] WireError),

    #[error("Link I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_error_display() {
        assert!(format!("{}", LinkError::Closed).contains("closed"));

        let err: LinkError = WireError::PayloadTooLarge { size: 3000, max: 2000 }.into();
        assert!(format!("{}", err).contains("Framing error"));

        let err: LinkError =
            std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof").into();
        assert!(format!("{}", err).contains("I/O error"));
    }
}
