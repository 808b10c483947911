use std::collections::HashSet;

use minnow_proto::Sid;

use crate::connection::ClientId;

/// A server somewhere on the network. Our own server is not in the map; this
/// only describes peers, directly linked or learned through a burst.
#[derive(Debug)]
pub struct Server {
    pub sid: Sid,
    pub name: String,
    pub description: String,
    /// 1 for directly-linked peers.
    pub hops: u32,
    /// The SID of the neighbour this server was learned through; `None` for
    /// directly-linked peers.
    pub linked_to: Option<Sid>,
    /// For a remote server, the directly-linked peer we route toward.
    pub closest: Option<ClientId>,
    /// For a directly-linked server, the LocalServer record's key.
    pub local_id: Option<ClientId>,
    /// Capability set, learned at link time or from GCAP.
    pub capabs: Option<HashSet<String>>,
}

impl Server {
    pub fn is_local(&self) -> bool {
        self.local_id.is_some()
    }

    pub fn has_capab(&self, name: &str) -> bool {
        self.capabs
            .as_ref()
            .is_some_and(|capabs| capabs.contains(name))
    }

    /// The capability set as a space-separated string, sorted so bursts are
    /// deterministic.
    pub fn capabs_string(&self) -> String {
        let mut list: Vec<&str> = self
            .capabs
            .iter()
            .flatten()
            .map(String::as_str)
            .collect();
        list.sort_unstable();
        list.join(" ")
    }
}
