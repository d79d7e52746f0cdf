//! Who plays where: handle roles and the connections serving them.

use crate::error::BastionError;
use crate::network::protocol::PeerConnection;
use crate::{Config, PlayerHandle, PlayerType};
use std::collections::BTreeMap;

/// Handle roles plus one [`PeerConnection`] per remote address.
///
/// An address hosting several remote players gets one connection; every
/// input message it sends carries all of its queues. Connections are created
/// by the session on start, the registry only stores them.
///
/// Re-exported in [`__internal`](crate::__internal) for tests.
pub struct PlayerRegistry<T>
where
    T: Config,
{
    /// Role of every registered handle.
    pub handles: BTreeMap<PlayerHandle, PlayerType<T::Address>>,
    /// Connections to player hosts.
    pub remotes: BTreeMap<T::Address, PeerConnection<T>>,
    /// Connections to spectators.
    pub spectators: BTreeMap<T::Address, PeerConnection<T>>,
}

impl<T: Config> std::fmt::Debug for PlayerRegistry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlayerRegistry")
            .field("handles", &self.handles)
            .field("remotes", &self.remotes.keys().collect::<Vec<_>>())
            .field("spectators", &self.spectators.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<T: Config> Default for PlayerRegistry<T> {
    fn default() -> Self {
        Self {
            handles: BTreeMap::new(),
            remotes: BTreeMap::new(),
            spectators: BTreeMap::new(),
        }
    }
}

impl<T: Config> PlayerRegistry<T> {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns `player_type` to `handle`.
    ///
    /// Player roles ([`PlayerType::Local`], [`PlayerType::Remote`]) need a
    /// handle below `num_players`, spectators one at or above it. One address
    /// can host players or spectate, not both.
    ///
    /// # Errors
    ///
    /// [`BastionError::InvalidPlayerHandle`] for a player handle out of range,
    /// [`BastionError::InvalidRequest`] for a taken handle or a role clash.
    pub fn register(
        &mut self,
        handle: PlayerHandle,
        player_type: PlayerType<T::Address>,
        num_players: usize,
    ) -> Result<(), BastionError> {
        let clash = |info: String| -> Result<(), BastionError> {
            Err(BastionError::InvalidRequest { info })
        };
        if self.handles.contains_key(&handle) {
            return clash(format!("handle {handle} is taken"));
        }
        match &player_type {
            PlayerType::Local | PlayerType::Remote(_) => {
                if !handle.is_valid_player_for(num_players) {
                    return Err(BastionError::InvalidPlayerHandle {
                        handle,
                        num_players,
                    });
                }
                if let PlayerType::Remote(addr) = &player_type {
                    if self.has_role(addr, true) {
                        return clash(format!("{addr:?} spectates and cannot host players"));
                    }
                }
            },
            PlayerType::Spectator(addr) => {
                if !handle.is_spectator_for(num_players) {
                    return clash(format!(
                        "handle {handle} belongs to a player; spectators start at {num_players}"
                    ));
                }
                if self.has_role(addr, false) {
                    return clash(format!("{addr:?} hosts players and cannot spectate"));
                }
            },
        }
        self.handles.insert(handle, player_type);
        Ok(())
    }

    fn handles_where<'a>(
        &'a self,
        keep: impl Fn(&PlayerType<T::Address>) -> bool + 'a,
    ) -> impl Iterator<Item = PlayerHandle> + 'a {
        self.handles
            .iter()
            .filter(move |(_, player_type)| keep(*player_type))
            .map(|(handle, _)| *handle)
    }

    /// Whether `addr` is registered as a spectator (`spectator`) or as a player host.
    fn has_role(&self, addr: &T::Address, spectator: bool) -> bool {
        self.handles.values().any(|player_type| match player_type {
            PlayerType::Remote(a) => !spectator && a == addr,
            PlayerType::Spectator(a) => spectator && a == addr,
            PlayerType::Local => false,
        })
    }

    /// How many queues are fed from this process.
    #[must_use]
    pub fn num_local(&self) -> usize {
        self.handles_where(|t| matches!(t, PlayerType::Local)).count()
    }

    /// Local queues, ascending.
    #[must_use]
    pub fn local_player_handles(&self) -> Vec<PlayerHandle> {
        self.handles_where(|t| matches!(t, PlayerType::Local)).collect()
    }

    /// Remote queues, ascending.
    #[must_use]
    pub fn remote_player_handles(&self) -> Vec<PlayerHandle> {
        self.handles_where(|t| matches!(t, PlayerType::Remote(_))).collect()
    }

    /// Spectator slots, ascending.
    #[must_use]
    pub fn spectator_handles(&self) -> Vec<PlayerHandle> {
        self.handles_where(|t| matches!(t, PlayerType::Spectator(_))).collect()
    }

    /// Spectator slots registered.
    #[must_use]
    pub fn num_spectators(&self) -> usize {
        self.handles_where(|t| matches!(t, PlayerType::Spectator(_))).count()
    }

    /// Each player host with the queues it feeds.
    #[must_use]
    pub fn remote_hosts(&self) -> BTreeMap<T::Address, Vec<PlayerHandle>> {
        let mut hosts: BTreeMap<T::Address, Vec<PlayerHandle>> = BTreeMap::new();
        for (handle, player_type) in &self.handles {
            if let PlayerType::Remote(addr) = player_type {
                hosts.entry(addr.clone()).or_default().push(*handle);
            }
        }
        hosts
    }

    /// Every spectating address once, ascending.
    #[must_use]
    pub fn spectator_addresses(&self) -> Vec<T::Address> {
        let unique: std::collections::BTreeSet<&T::Address> = self
            .handles
            .values()
            .filter_map(|player_type| match player_type {
                PlayerType::Spectator(addr) => Some(addr),
                _ => None,
            })
            .collect();
        unique.into_iter().cloned().collect()
    }

    /// The connection serving `handle`; `None` for local queues and before start.
    #[must_use]
    pub fn connection(&self, handle: PlayerHandle) -> Option<&PeerConnection<T>> {
        match self.handles.get(&handle)? {
            PlayerType::Local => None,
            PlayerType::Remote(addr) => self.remotes.get(addr),
            PlayerType::Spectator(addr) => self.spectators.get(addr),
        }
    }

    /// Player hosts first, then spectators.
    pub fn connections_mut(&mut self) -> impl Iterator<Item = &mut PeerConnection<T>> {
        self.remotes.values_mut().chain(self.spectators.values_mut())
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::test_config::TestConfig;
    use std::net::{Ipv4Addr, SocketAddr};

    const HOST: u16 = 8001;
    const WATCHER: u16 = 9000;

    fn at(port: u16) -> SocketAddr {
        (Ipv4Addr::LOCALHOST, port).into()
    }

    fn handles(raw: &[usize]) -> Vec<PlayerHandle> {
        raw.iter().copied().map(PlayerHandle::new).collect()
    }

    /// Three players, two of them behind one address, and two spectator slots on one address.
    fn couch_game() -> PlayerRegistry<TestConfig> {
        let mut registry = PlayerRegistry::new();
        let roles = [
            PlayerType::Local,
            PlayerType::Remote(at(HOST)),
            PlayerType::Remote(at(HOST)),
            PlayerType::Spectator(at(WATCHER)),
            PlayerType::Spectator(at(WATCHER)),
        ];
        for (handle, role) in roles.into_iter().enumerate() {
            registry.register(PlayerHandle::new(handle), role, 3).unwrap();
        }
        registry
    }

    #[test]
    fn roles_are_listed_in_handle_order() {
        let registry = couch_game();
        assert_eq!(registry.local_player_handles(), handles(&[0]));
        assert_eq!(registry.num_local(), 1);
        assert_eq!(registry.remote_player_handles(), handles(&[1, 2]));
        assert_eq!(registry.spectator_handles(), handles(&[3, 4]));
        assert_eq!(registry.num_spectators(), 2);
    }

    #[test]
    fn shared_addresses_collapse() {
        let registry = couch_game();
        let hosts = registry.remote_hosts();
        assert_eq!(hosts.keys().copied().collect::<Vec<_>>(), [at(HOST)]);
        assert_eq!(hosts[&at(HOST)], handles(&[1, 2]));
        assert_eq!(registry.spectator_addresses(), [at(WATCHER)]);
    }

    #[test]
    fn taken_handle_is_refused() {
        let mut registry = couch_game();
        let err = registry
            .register(PlayerHandle::new(1), PlayerType::Local, 3)
            .unwrap_err();
        assert!(matches!(err, BastionError::InvalidRequest { .. }));
        assert_eq!(registry.handles[&PlayerHandle::new(1)], PlayerType::Remote(at(HOST)));
    }

    #[test]
    fn handle_ranges_follow_the_role() {
        let mut registry = PlayerRegistry::<TestConfig>::new();
        assert_eq!(
            registry.register(PlayerHandle::new(2), PlayerType::Remote(at(HOST)), 2),
            Err(BastionError::InvalidPlayerHandle {
                handle: PlayerHandle::new(2),
                num_players: 2,
            })
        );
        assert!(matches!(
            registry.register(PlayerHandle::new(1), PlayerType::Spectator(at(WATCHER)), 2),
            Err(BastionError::InvalidRequest { .. })
        ));
        assert!(registry.handles.is_empty());
    }

    #[test]
    fn an_address_has_one_role() {
        let mut registry = couch_game();
        assert!(registry
            .register(PlayerHandle::new(5), PlayerType::Spectator(at(HOST)), 3)
            .is_err());

        let mut registry = PlayerRegistry::<TestConfig>::new();
        registry
            .register(PlayerHandle::new(2), PlayerType::Spectator(at(WATCHER)), 2)
            .unwrap();
        assert!(registry
            .register(PlayerHandle::new(0), PlayerType::Remote(at(WATCHER)), 2)
            .is_err());
    }

    #[test]
    fn connections_appear_only_once_started() {
        let mut registry = couch_game();
        assert!(registry.connection(PlayerHandle::new(0)).is_none());
        assert!(registry.connection(PlayerHandle::new(2)).is_none());
        assert_eq!(registry.connections_mut().count(), 0);
    }
}
