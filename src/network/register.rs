/// Number of multicast groups a McGroupIDHeader can address
pub const MAX_MULTICAST_GROUPS: usize = 4;

/// One multicast group context held by the MAC layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct McGroup {
    /// Multicast network address
    pub address: u32,
    /// McKey as received, encrypted with McKEKey; the MAC derives session keys from it
    pub key_encrypted: [u8; 16],
    pub min_fcount: u32,
    pub max_fcount: u32,
}

/// Multicast address register
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MulticastRegister {
    groups: Vec<Option<McGroup>>,
}

impl Default for MulticastRegister {
    fn default() -> Self {
        MulticastRegister::new(MAX_MULTICAST_GROUPS)
    }
}

impl MulticastRegister {
    /// Creates a register with `slots` groups, capped at what the protocol can address
    pub fn new(slots: usize) -> Self {
        MulticastRegister {
            groups: vec![None; slots.min(MAX_MULTICAST_GROUPS)],
        }
    }

    /// Number of groups the register can hold
    pub fn slots(&self) -> usize {
        self.groups.len()
    }

    pub fn get(&self, id: u8) -> Option<&McGroup> {
        self.groups.get(id as usize).and_then(Option::as_ref)
    }

    /// Stores a group; fails if the id has no slot
    pub fn set(&mut self, id: u8, group: McGroup) -> bool {
        match self.groups.get_mut(id as usize) {
            Some(slot) => {
                *slot = Some(group);
                true
            }
            None => false,
        }
    }

    /// Removes a group; returns whether it was defined
    pub fn remove(&mut self, id: u8) -> bool {
        self.groups
            .get_mut(id as usize)
            .and_then(Option::take)
            .is_some()
    }

    /// Defined groups as `(id, group)`
    pub fn defined(&self) -> impl Iterator<Item = (u8, &McGroup)> {
        self.groups
            .iter()
            .enumerate()
            .filter_map(|(id, g)| g.as_ref().map(|g| (id as u8, g)))
    }

    /// Group id owning a multicast address
    pub fn group_for_address(&self, address: u32) -> Option<u8> {
        self.defined()
            .find(|(_, g)| g.address == address)
            .map(|(id, _)| id)
    }
}
