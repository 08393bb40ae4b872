// The lobby roster: every known player, keyed by id.
//
// `upsert` is last-writer-wins per id and never duplicates. Host records are
// kept at the front so every participant renders the same order for a
// two-player lobby; everyone else keeps arrival order.

use parlor_protocol::LobbyPlayer;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Roster {
    players: Vec<LobbyPlayer>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace by id. Returns true if the roster changed.
    pub fn upsert(&mut self, player: LobbyPlayer) -> bool {
        if let Some(existing) = self.players.iter_mut().find(|p| p.id == player.id) {
            if *existing == player {
                return false;
            }
            *existing = player;
            return true;
        }
        if player.is_host {
            let at = self.players.iter().take_while(|p| p.is_host).count();
            self.players.insert(at, player);
        } else {
            self.players.push(player);
        }
        true
    }

    pub fn remove(&mut self, id: &str) -> Option<LobbyPlayer> {
        let index = self.players.iter().position(|p| p.id == id)?;
        Some(self.players.remove(index))
    }

    pub fn get(&self, id: &str) -> Option<&LobbyPlayer> {
        self.players.iter().find(|p| p.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn players(&self) -> &[LobbyPlayer] {
        &self.players
    }

    /// Drop everyone except `id`.
    pub fn retain_only(&mut self, id: &str) {
        self.players.retain(|p| p.id == id);
    }

    pub fn clear(&mut self) {
        self.players.clear();
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }
}
