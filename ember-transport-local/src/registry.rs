//! Process-wide table of bound local endpoints, keyed by the name passed to
//! `bind(ChannelAddress::Local(name))`. `connect` claims (removes) the entry
//! it rendezvous with: a bound name is a one-shot invitation, mirroring a
//! listening socket accepting exactly one peer per `connect` rather than a
//! broadcast channel.

use std::sync::{Arc, OnceLock};

use dashmap::{mapref::entry::Entry, DashMap};
use ember_core::channel::ChannelId;
use ember_core::{Channel, CoreError, ErrorKind, Result};

use crate::channel::LocalChannel;

fn table() -> &'static DashMap<String, Arc<LocalChannel>> {
    static TABLE: OnceLock<DashMap<String, Arc<LocalChannel>>> = OnceLock::new();
    TABLE.get_or_init(DashMap::new)
}

pub fn bind(name: String, channel: Arc<LocalChannel>) -> Result<()> {
    match table().entry(name) {
        Entry::Occupied(entry) => Err(CoreError::new(
            ErrorKind::TransportIo,
            format!("local endpoint {} is already bound", entry.key()),
        )),
        Entry::Vacant(entry) => {
            entry.insert(channel);
            Ok(())
        }
    }
}

pub fn claim(name: &str) -> Option<Arc<LocalChannel>> {
    table().remove(name).map(|(_, channel)| channel)
}

/// Removes a bound entry only if it still belongs to `owner`, so a channel
/// that already lost its slot to a racing `connect` doesn't clobber whatever
/// later bound the same name.
pub fn unbind(name: &str, owner: ChannelId) {
    table().remove_if(name, |_, channel| channel.id() == owner);
}
