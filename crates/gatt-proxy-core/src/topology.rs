//! Topology model: the expected services and characteristics, and the
//! handles bound to them on each side of the proxy.
//!
//! A [`Topology`] is shaped once from the configuration and then only gains
//! handle bindings. Ids that were not configured are rejected with
//! [`ProxyError::UnknownIdentifier`], so the remote device can never grow
//! the mirrored surface beyond what was asked for.

use uuid::Uuid;

use crate::config::ServiceConfig;
use crate::error::{ProxyError, Result};
use crate::gatt::{CharacteristicId, CharacteristicProperties, MirrorHandle, RemoteHandle};

/// A characteristic of the expected topology
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicDescriptor {
    /// Characteristic id
    pub id: Uuid,
    /// Capabilities as discovered on the remote device
    pub properties: CharacteristicProperties,
    /// Handle on the remote device, once discovered
    pub remote_handle: Option<RemoteHandle>,
    /// Handle of the published mirror, once published
    pub mirror_handle: Option<MirrorHandle>,
}

impl CharacteristicDescriptor {
    fn new(id: Uuid) -> Self {
        Self {
            id,
            properties: CharacteristicProperties::empty(),
            remote_handle: None,
            mirror_handle: None,
        }
    }

    /// Usable for relay only when both sides are bound
    pub fn is_bound(&self) -> bool {
        self.remote_handle.is_some() && self.mirror_handle.is_some()
    }
}

/// A service of the expected topology
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    /// Service id
    pub id: Uuid,
    /// Characteristics in configuration order
    pub characteristics: Vec<CharacteristicDescriptor>,
    /// Handle on the remote device, once discovered
    pub remote_handle: Option<RemoteHandle>,
    /// Handle of the published mirror, once published
    pub mirror_handle: Option<MirrorHandle>,
}

impl ServiceDescriptor {
    /// Look up a characteristic by id
    pub fn characteristic(&self, id: Uuid) -> Option<&CharacteristicDescriptor> {
        self.characteristics.iter().find(|c| c.id == id)
    }

    fn characteristic_mut(&mut self, id: Uuid) -> Option<&mut CharacteristicDescriptor> {
        self.characteristics.iter_mut().find(|c| c.id == id)
    }

    /// Whether this service and all of its characteristics are bound remotely
    pub fn is_remote_complete(&self) -> bool {
        self.remote_handle.is_some()
            && self.characteristics.iter().all(|c| c.remote_handle.is_some())
    }
}

/// Expected services with their per-side handle bindings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    services: Vec<ServiceDescriptor>,
}

impl Topology {
    /// Build an empty-but-shaped topology from the configured services
    pub fn build(services: &[ServiceConfig]) -> Self {
        let services = services
            .iter()
            .map(|service| ServiceDescriptor {
                id: service.uuid,
                characteristics: service
                    .characteristics
                    .iter()
                    .copied()
                    .map(CharacteristicDescriptor::new)
                    .collect(),
                remote_handle: None,
                mirror_handle: None,
            })
            .collect();
        Self { services }
    }

    /// All services in configuration order
    pub fn services(&self) -> &[ServiceDescriptor] {
        &self.services
    }

    /// Ids of all services in configuration order
    pub fn service_ids(&self) -> Vec<Uuid> {
        self.services.iter().map(|s| s.id).collect()
    }

    /// Ids of every characteristic in configuration order
    pub fn characteristic_ids(&self) -> impl Iterator<Item = CharacteristicId> + '_ {
        self.services.iter().flat_map(|service| {
            service
                .characteristics
                .iter()
                .map(move |c| CharacteristicId::new(service.id, c.id))
        })
    }

    /// Look up a service by id
    pub fn service(&self, id: Uuid) -> Option<&ServiceDescriptor> {
        self.services.iter().find(|s| s.id == id)
    }

    /// Look up a characteristic by its full id
    pub fn characteristic(&self, id: &CharacteristicId) -> Option<&CharacteristicDescriptor> {
        self.service(id.service)
            .and_then(|service| service.characteristic(id.characteristic))
    }

    fn service_mut(&mut self, id: Uuid) -> Result<&mut ServiceDescriptor> {
        self.services
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| ProxyError::UnknownIdentifier(format!("service {}", id)))
    }

    fn characteristic_mut(&mut self, id: &CharacteristicId) -> Result<&mut CharacteristicDescriptor> {
        self.service_mut(id.service)?
            .characteristic_mut(id.characteristic)
            .ok_or_else(|| ProxyError::UnknownIdentifier(format!("characteristic {}", id)))
    }

    /// Bind the remote handle of a configured service
    pub fn bind_remote_service(&mut self, service: Uuid, handle: RemoteHandle) -> Result<()> {
        self.service_mut(service)?.remote_handle = Some(handle);
        Ok(())
    }

    /// Bind the remote handle and discovered properties of a configured characteristic
    pub fn bind_remote(
        &mut self,
        id: &CharacteristicId,
        handle: RemoteHandle,
        properties: CharacteristicProperties,
    ) -> Result<()> {
        let characteristic = self.characteristic_mut(id)?;
        characteristic.remote_handle = Some(handle);
        characteristic.properties = properties;
        Ok(())
    }

    /// Bind the mirror handle of a configured service
    pub fn bind_mirror_service(&mut self, service: Uuid, handle: MirrorHandle) -> Result<()> {
        self.service_mut(service)?.mirror_handle = Some(handle);
        Ok(())
    }

    /// Bind the mirror handle of a configured characteristic
    pub fn bind_mirror(&mut self, id: &CharacteristicId, handle: MirrorHandle) -> Result<()> {
        self.characteristic_mut(id)?.mirror_handle = Some(handle);
        Ok(())
    }

    /// Every service and characteristic has its remote handle bound
    pub fn is_remote_complete(&self) -> bool {
        !self.services.is_empty() && self.services.iter().all(|s| s.is_remote_complete())
    }

    /// Every service and characteristic has both handles bound
    pub fn is_complete(&self) -> bool {
        !self.services.is_empty()
            && self.services.iter().all(|service| {
                service.remote_handle.is_some()
                    && service.mirror_handle.is_some()
                    && service.characteristics.iter().all(|c| c.is_bound())
            })
    }

    /// Resolve a remote service handle to its configured id
    pub fn service_by_remote_handle(&self, handle: RemoteHandle) -> Option<Uuid> {
        self.services
            .iter()
            .find(|s| s.remote_handle == Some(handle))
            .map(|s| s.id)
    }

    /// Resolve a remote characteristic handle to its configured id
    pub fn find_by_remote_handle(&self, handle: RemoteHandle) -> Option<CharacteristicId> {
        self.find(|c| c.remote_handle == Some(handle))
    }

    /// Resolve a mirror characteristic handle to its configured id
    pub fn find_by_mirror_handle(&self, handle: MirrorHandle) -> Option<CharacteristicId> {
        self.find(|c| c.mirror_handle == Some(handle))
    }

    fn find(&self, pred: impl Fn(&CharacteristicDescriptor) -> bool) -> Option<CharacteristicId> {
        self.services.iter().find_map(|service| {
            service
                .characteristics
                .iter()
                .find(|c| pred(c))
                .map(|c| CharacteristicId::new(service.id, c.id))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(service: u128, characteristic: u128) -> CharacteristicId {
        CharacteristicId::new(Uuid::from_u128(service), Uuid::from_u128(characteristic))
    }

    fn two_service_topology() -> Topology {
        Topology::build(&[
            ServiceConfig::new(Uuid::from_u128(1), [Uuid::from_u128(11), Uuid::from_u128(12)]),
            ServiceConfig::new(Uuid::from_u128(2), [Uuid::from_u128(21)]),
        ])
    }

    #[test]
    fn test_build_preserves_order() {
        let topology = two_service_topology();
        assert_eq!(
            topology.service_ids(),
            vec![Uuid::from_u128(1), Uuid::from_u128(2)]
        );
        let ids: Vec<_> = topology.characteristic_ids().collect();
        assert_eq!(ids, vec![id(1, 11), id(1, 12), id(2, 21)]);
        assert!(!topology.is_remote_complete());
        assert!(!topology.is_complete());
    }

    #[test]
    fn test_unknown_identifier() {
        let mut topology = two_service_topology();
        let err = topology
            .bind_remote_service(Uuid::from_u128(99), RemoteHandle(1))
            .unwrap_err();
        assert!(matches!(err, ProxyError::UnknownIdentifier(_)));

        let err = topology
            .bind_mirror(&id(1, 99), MirrorHandle(1))
            .unwrap_err();
        assert!(matches!(err, ProxyError::UnknownIdentifier(_)));
    }

    #[test]
    fn test_completeness_is_order_independent() {
        let mut topology = two_service_topology();
        // Bind in reverse order of configuration
        topology.bind_remote(&id(2, 21), RemoteHandle(21), CharacteristicProperties::READ).unwrap();
        topology.bind_remote_service(Uuid::from_u128(2), RemoteHandle(2)).unwrap();
        topology.bind_remote(&id(1, 12), RemoteHandle(12), CharacteristicProperties::READ).unwrap();
        assert!(!topology.is_remote_complete());
        topology.bind_remote_service(Uuid::from_u128(1), RemoteHandle(1)).unwrap();
        assert!(!topology.is_remote_complete());
        topology.bind_remote(&id(1, 11), RemoteHandle(11), CharacteristicProperties::WRITE).unwrap();
        assert!(topology.is_remote_complete());
        assert!(!topology.is_complete());

        let ids: Vec<_> = topology.characteristic_ids().collect();
        for (n, cid) in ids.iter().enumerate() {
            topology.bind_mirror(cid, MirrorHandle(100 + n as u64)).unwrap();
        }
        topology.bind_mirror_service(Uuid::from_u128(1), MirrorHandle(1)).unwrap();
        assert!(!topology.is_complete());
        topology.bind_mirror_service(Uuid::from_u128(2), MirrorHandle(2)).unwrap();
        assert!(topology.is_complete());
    }

    #[test]
    fn test_handle_lookups() {
        let mut topology = two_service_topology();
        topology.bind_remote_service(Uuid::from_u128(1), RemoteHandle(1)).unwrap();
        topology
            .bind_remote(&id(1, 12), RemoteHandle(12), CharacteristicProperties::NOTIFY)
            .unwrap();
        topology.bind_mirror(&id(1, 12), MirrorHandle(7)).unwrap();

        assert_eq!(topology.service_by_remote_handle(RemoteHandle(1)), Some(Uuid::from_u128(1)));
        assert_eq!(topology.find_by_remote_handle(RemoteHandle(12)), Some(id(1, 12)));
        assert_eq!(topology.find_by_mirror_handle(MirrorHandle(7)), Some(id(1, 12)));
        assert_eq!(topology.find_by_mirror_handle(MirrorHandle(8)), None);
        assert_eq!(
            topology.characteristic(&id(1, 12)).unwrap().properties,
            CharacteristicProperties::NOTIFY
        );
    }

    #[test]
    fn test_empty_topology_is_never_complete() {
        let topology = Topology::build(&[]);
        assert!(!topology.is_remote_complete());
        assert!(!topology.is_complete());
    }
}
