// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

use std::error;
use std::fmt;
use std::io;
use std::result;

/// Result of every fallible fabric operation. The fabric never panics on
/// wire input; malformed messages and socket failures come back as codes.
pub type Result<T> = result::Result<T, Error>;

/// Error codes reported by the fabric.
#[derive(Debug)]
pub enum Error {
    /// Generic failure with no more specific code.
    Fail,
    /// An operation was attempted before the session was built, or after finish.
    NotInitialized,
    /// A service, method or ensemble name is not acceptable.
    BadName(String),
    /// A type string or argument type is not acceptable, or coercion failed.
    BadType(char),
    /// The addressed service has no provider.
    NoService(String),
    /// A local service with that name already exists.
    ServiceExists(String),
    /// A handler placement collides with an existing handler or subtree.
    ServiceConflict(String),
    /// A message failed wire-level validation.
    InvalidMsg,
    /// A socket-level error, fatal to that socket.
    Socket(io::Error),
    /// The operation could not complete without blocking.
    Blocked,
    /// The session is already running, the setting can no longer be changed.
    AlreadyRunning,
    /// The remote end closed the TCP connection.
    TcpHup,
    /// An address could not be resolved.
    HostnameLookup,
}

impl Error {
    pub fn name(&self) -> &'static str {
        match *self {
            Error::Fail               => "Fail",
            Error::NotInitialized     => "NotInitialized",
            Error::BadName(_)         => "BadName",
            Error::BadType(_)         => "BadType",
            Error::NoService(_)       => "NoService",
            Error::ServiceExists(_)   => "ServiceExists",
            Error::ServiceConflict(_) => "ServiceConflict",
            Error::InvalidMsg         => "InvalidMsg",
            Error::Socket(_)          => "SocketError",
            Error::Blocked            => "Blocked",
            Error::AlreadyRunning     => "AlreadyRunning",
            Error::TcpHup             => "TcpHup",
            Error::HostnameLookup     => "HostnameLookupFail",
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::BadName(ref name)         => write!(formatter, "bad name: '{}'", name),
            Error::BadType(code)             => write!(formatter, "bad type: '{}'", code),
            Error::NoService(ref name)       => write!(formatter, "no service: '{}'", name),
            Error::ServiceExists(ref name)   => write!(formatter, "service exists: '{}'", name),
            Error::ServiceConflict(ref name) => write!(formatter, "service conflict: '{}'", name),
            Error::Socket(ref err)           => write!(formatter, "socket error: {}", err),
            _                                => formatter.write_str(self.name()),
        }
    }
}

impl error::Error for Error {
    fn description(&self) -> &str {
        self.name()
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::Socket(err)
    }
}

pub fn other_io_error(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::Other, msg)
}

pub fn invalid_data_io_error(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

pub fn would_block_io_error(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::WouldBlock, msg)
}

#[cfg(test)]
mod tests {
    use super::Error;

    #[test]
    fn codes_keep_their_names() {
        assert_eq!("NoService", Error::NoService("x".to_owned()).name());
        assert_eq!("SocketError",
                   Error::from(super::other_io_error("boom")).name());
        assert_eq!("HostnameLookupFail", Error::HostnameLookup.name());
    }
}
