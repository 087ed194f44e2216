//! uid/gid translation between client-space and server-space.

use std::collections::BTreeMap;

/// Two bijective partial maps; ids outside the maps pass through
/// unchanged.
#[derive(Debug, Clone, Default)]
pub struct IdTranslator {
    uid_to_server: BTreeMap<u32, u32>,
    uid_to_client: BTreeMap<u32, u32>,
    gid_to_server: BTreeMap<u32, u32>,
    gid_to_client: BTreeMap<u32, u32>,
}

impl IdTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_uid(&mut self, server: u32, client: u32) {
        self.uid_to_server.insert(client, server);
        self.uid_to_client.insert(server, client);
    }

    pub fn add_gid(&mut self, server: u32, client: u32) {
        self.gid_to_server.insert(client, server);
        self.gid_to_client.insert(server, client);
    }

    pub fn server_uid(&self, client: u32) -> u32 {
        *self.uid_to_server.get(&client).unwrap_or(&client)
    }

    pub fn client_uid(&self, server: u32) -> u32 {
        *self.uid_to_client.get(&server).unwrap_or(&server)
    }

    pub fn server_gid(&self, client: u32) -> u32 {
        *self.gid_to_server.get(&client).unwrap_or(&client)
    }

    pub fn client_gid(&self, server: u32) -> u32 {
        *self.gid_to_client.get(&server).unwrap_or(&server)
    }

    pub fn is_empty(&self) -> bool {
        self.uid_to_server.is_empty() && self.gid_to_server.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapped_ids_translate_both_ways() {
        let mut translator = IdTranslator::new();
        translator.add_uid(500, 1000);
        translator.add_gid(500, 100);

        assert_eq!(translator.server_uid(1000), 500);
        assert_eq!(translator.client_uid(500), 1000);
        assert_eq!(translator.server_gid(100), 500);
        assert_eq!(translator.client_gid(500), 100);
    }

    #[test]
    fn unmapped_ids_pass_through() {
        let translator = IdTranslator::new();
        assert_eq!(translator.server_uid(42), 42);
        assert_eq!(translator.client_gid(42), 42);
    }
}
