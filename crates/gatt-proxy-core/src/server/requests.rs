//! Open inbound requests awaiting a response from the remote side

use std::collections::HashMap;

use crate::gatt::{CharacteristicId, ClientId, RequestId};

/// A local client request that has not been answered yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRequest {
    /// Correlation id for the response
    pub request: RequestId,
    /// Requesting client
    pub client: ClientId,
}

/// Open reads and writes, each kept as an arrival-ordered set per characteristic
#[derive(Debug, Default)]
pub struct OpenRequests {
    reads: HashMap<CharacteristicId, Vec<OpenRequest>>,
    writes: HashMap<CharacteristicId, Vec<OpenRequest>>,
}

impl OpenRequests {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an open read
    pub fn add_read(&mut self, characteristic: CharacteristicId, request: OpenRequest) {
        self.reads.entry(characteristic).or_default().push(request);
    }

    /// Record an open write
    pub fn add_write(&mut self, characteristic: CharacteristicId, request: OpenRequest) {
        self.writes.entry(characteristic).or_default().push(request);
    }

    /// Remove and return every open read for a characteristic, in arrival order
    pub fn take_reads(&mut self, characteristic: &CharacteristicId) -> Vec<OpenRequest> {
        self.reads.remove(characteristic).unwrap_or_default()
    }

    /// Remove and return every open write for a characteristic, in arrival order
    pub fn take_writes(&mut self, characteristic: &CharacteristicId) -> Vec<OpenRequest> {
        self.writes.remove(characteristic).unwrap_or_default()
    }

    /// Remove and return everything still open
    pub fn drain_all(&mut self) -> Vec<OpenRequest> {
        self.reads
            .drain()
            .chain(self.writes.drain())
            .flat_map(|(_, requests)| requests)
            .collect()
    }

    /// Open reads for a characteristic
    pub fn read_count(&self, characteristic: &CharacteristicId) -> usize {
        self.reads.get(characteristic).map_or(0, Vec::len)
    }

    /// Open writes for a characteristic
    pub fn write_count(&self, characteristic: &CharacteristicId) -> usize {
        self.writes.get(characteristic).map_or(0, Vec::len)
    }

    /// Open reads across all characteristics
    pub fn total_reads(&self) -> usize {
        self.reads.values().map(Vec::len).sum()
    }

    /// Open writes across all characteristics
    pub fn total_writes(&self) -> usize {
        self.writes.values().map(Vec::len).sum()
    }

    /// Whether nothing is open
    pub fn is_empty(&self) -> bool {
        self.total_reads() == 0 && self.total_writes() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn char_id(n: u128) -> CharacteristicId {
        CharacteristicId::new(Uuid::from_u128(1), Uuid::from_u128(n))
    }

    fn open(n: u64) -> OpenRequest {
        OpenRequest {
            request: RequestId(n),
            client: ClientId(format!("client-{}", n)),
        }
    }

    #[test]
    fn test_take_preserves_arrival_order() {
        let mut requests = OpenRequests::new();
        requests.add_write(char_id(2), open(1));
        requests.add_write(char_id(2), open(2));
        requests.add_write(char_id(3), open(3));

        assert_eq!(requests.write_count(&char_id(2)), 2);
        let taken = requests.take_writes(&char_id(2));
        assert_eq!(taken, vec![open(1), open(2)]);
        assert_eq!(requests.write_count(&char_id(2)), 0);
        assert_eq!(requests.total_writes(), 1);
    }

    #[test]
    fn test_take_from_empty_is_noop() {
        let mut requests = OpenRequests::new();
        assert!(requests.take_reads(&char_id(2)).is_empty());
        assert!(requests.is_empty());
    }

    #[test]
    fn test_reads_and_writes_are_separate() {
        let mut requests = OpenRequests::new();
        requests.add_read(char_id(2), open(1));
        requests.add_write(char_id(2), open(2));

        assert_eq!(requests.take_reads(&char_id(2)), vec![open(1)]);
        assert_eq!(requests.write_count(&char_id(2)), 1);
    }

    #[test]
    fn test_drain_all() {
        let mut requests = OpenRequests::new();
        requests.add_read(char_id(2), open(1));
        requests.add_write(char_id(3), open(2));
        requests.add_write(char_id(3), open(3));

        let mut drained = requests.drain_all();
        drained.sort_by_key(|r| r.request);
        assert_eq!(drained, vec![open(1), open(2), open(3)]);
        assert!(requests.is_empty());
    }
}
