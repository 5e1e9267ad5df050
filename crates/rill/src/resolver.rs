use std::{net::ToSocketAddrs, thread};

use tracing::debug;

use crate::error::Error;

pub type ResolveDone = Box<dyn FnOnce(Result<std::net::SocketAddr, Error>) + Send>;

/// Name resolution seam. The socket never blocks on it: implementations
/// deliver the result through `done`, typically posted back onto the
/// reactor's remote queue.
pub trait Resolver {
    /// Resolve `name` (a `host:port` string) to one address.
    fn resolve(&self, name: &str, done: ResolveDone);
}

/// Default resolver: standard-library lookup on a throwaway helper thread.
pub struct SystemResolver;

impl Resolver for SystemResolver {
    fn resolve(&self, name: &str, done: ResolveDone) {
        let name = name.to_owned();
        thread::spawn(move || {
            let result = match name.to_socket_addrs() {
                Ok(mut addrs) => addrs.next().ok_or(Error::Invalid),
                Err(err) => {
                    debug!(name, ?err, "resolver: lookup failed");
                    Err(Error::from(err))
                }
            };
            done(result);
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;

    #[test]
    fn resolves_localhost() {
        let (tx, rx) = mpsc::channel();
        SystemResolver.resolve(
            "localhost:4242",
            Box::new(move |result| {
                tx.send(result).unwrap();
            }),
        );
        let addr = rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap().unwrap();
        assert_eq!(addr.port(), 4242);
        assert!(addr.ip().is_loopback());
    }

    #[test]
    fn reports_garbage_names() {
        let (tx, rx) = mpsc::channel();
        SystemResolver.resolve(
            "not a host name",
            Box::new(move |result| {
                tx.send(result).unwrap();
            }),
        );
        let result = rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
        assert!(result.is_err());
    }
}
