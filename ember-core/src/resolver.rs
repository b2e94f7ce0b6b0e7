//! Address resolution, decoupled from any particular transport: a
//! `Bootstrap` resolves a [`ChannelAddress::Host`] before handing it to a
//! `ChannelFactory`, rather than every transport reimplementing DNS.

use std::net::ToSocketAddrs;
use std::thread;

use crate::channel::ChannelAddress;
use crate::error::{CoreError, ErrorKind};
use crate::promise::{Promise, PromiseWatcher};

/// Resolves a possibly-unresolved [`ChannelAddress`] to one the transport
/// layer can open a socket against. `resolve` completes asynchronously,
/// since resolution may block on a DNS round trip.
pub trait NameResolver: Send + Sync {
    fn is_resolved(&self, address: &ChannelAddress) -> bool;
    fn resolve(&self, address: ChannelAddress) -> PromiseWatcher<ChannelAddress>;
}

/// The default resolver: `Socket` and `Local` addresses are already
/// resolved; a `Host` address is resolved by running
/// [`std::net::ToSocketAddrs`] (blocking) on a dedicated thread, since this
/// core carries no async runtime to offload it onto.
pub struct SystemNameResolver;

impl NameResolver for SystemNameResolver {
    fn is_resolved(&self, address: &ChannelAddress) -> bool {
        !matches!(address, ChannelAddress::Host { .. })
    }

    fn resolve(&self, address: ChannelAddress) -> PromiseWatcher<ChannelAddress> {
        let (promise, watcher) = Promise::new();

        let ChannelAddress::Host { host, port } = address else {
            promise.succeed(address);
            return watcher;
        };

        thread::Builder::new()
            .name("ember-resolve".to_string())
            .spawn(move || {
                let resolved = (host.as_str(), port)
                    .to_socket_addrs()
                    .ok()
                    .and_then(|mut addrs| addrs.next());

                match resolved {
                    Some(addr) => promise.succeed(ChannelAddress::Socket(addr)),
                    None => promise.fail(CoreError::new(
                        ErrorKind::TransportIo,
                        format!("could not resolve host {host}:{port}"),
                    )),
                }
            })
            .expect("spawning a resolver thread");

        watcher
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_addresses_are_already_resolved() {
        let resolver = SystemNameResolver;
        let addr = ChannelAddress::Socket("127.0.0.1:9000".parse().unwrap());
        assert!(resolver.is_resolved(&addr));
    }

    #[test]
    fn local_addresses_are_already_resolved() {
        let resolver = SystemNameResolver;
        assert!(resolver.is_resolved(&ChannelAddress::Local("svc-a".into())));
    }

    #[test]
    fn host_addresses_resolve_to_a_socket() {
        let resolver = SystemNameResolver;
        let watcher = resolver.resolve(ChannelAddress::Host { host: "localhost".into(), port: 9000 });
        let outcome = watcher.wait();
        match &*outcome {
            crate::promise::Outcome::Success(ChannelAddress::Socket(addr)) => {
                assert_eq!(addr.port(), 9000);
            }
            other => panic!("expected a resolved socket address, got {other:?}"),
        }
    }
}
