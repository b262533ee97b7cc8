//! Block-store lifecycle
//!
//! The fragmentation package asks a [`BlockAllocator`] for storage when the
//! first fragment of a session arrives. The allocator hands back opaque
//! handles for the store and its assembler; at most one reassembly session
//! holds storage at a time, and allocating a new one releases the previous.

mod assembler;
mod block;

pub use assembler::{AssemblyProgress, AssemblyStatus, FragLayout, FragmentAssembler};
pub use block::BlockStore;

#[cfg(test)]
pub(crate) use assembler::matrix_line;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::core::{Error, Result, StorageConfig};

/// Opaque identifier of an allocated block store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StoreHandle(pub u32);

/// Opaque identifier of the assembler bound to a store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AssemblerHandle(pub u32);

/// Storage granted to one fragmentation session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockOptions {
    /// Bytes available past the write offset
    pub capacity: usize,
    /// Parity fragments the assembler will buffer
    pub redundancy: usize,
    pub store: StoreHandle,
    pub assembler: AssemblerHandle,
}

/// Hands out and reclaims reassembly storage
pub trait BlockAllocator {
    /// Largest image a session can hold
    fn capacity(&self) -> usize;

    /// Reserves storage for a session, releasing any session still open
    fn allocate(&mut self, session_index: u8, descriptor: u32, layout: FragLayout) -> Result<BlockOptions>;

    /// Frees a store; false if the handle is not live
    fn release(&mut self, store: StoreHandle) -> bool;

    /// Feeds fragment `n` of the session owning `assembler`
    fn write_fragment(&mut self, assembler: AssemblerHandle, n: u16, payload: &[u8]) -> Result<AssemblyStatus>;

    fn progress(&self, assembler: AssemblerHandle) -> Option<AssemblyProgress>;

    /// Reads the first `len` bytes of a store's image
    fn read(&self, store: StoreHandle, len: usize) -> Result<Bytes>;
}

/// A live reassembly session and the storage it owns
#[derive(Debug)]
pub struct ReassemblySession {
    pub index: u8,
    pub descriptor: u32,
    pub options: BlockOptions,
    store: BlockStore,
    assembler: FragmentAssembler,
}

/// Default allocator backed by heap block stores
#[derive(Debug)]
pub struct BlockStoreManager {
    config: StorageConfig,
    next_handle: u32,
    open: Option<ReassemblySession>,
}

impl BlockStoreManager {
    pub fn new(config: StorageConfig) -> Self {
        BlockStoreManager {
            config,
            next_handle: 1,
            open: None,
        }
    }

    /// Whether `store` still owns storage
    pub fn is_live(&self, store: StoreHandle) -> bool {
        self.open
            .as_ref()
            .map_or(false, |s| s.options.store == store)
    }

    pub fn session(&self) -> Option<&ReassemblySession> {
        self.open.as_ref()
    }

    fn session_for(&self, assembler: AssemblerHandle) -> Option<&ReassemblySession> {
        self.open
            .as_ref()
            .filter(|s| s.options.assembler == assembler)
    }

    fn next_id(&mut self) -> u32 {
        let id = self.next_handle;
        self.next_handle = self.next_handle.wrapping_add(1).max(1);
        id
    }
}

impl BlockAllocator for BlockStoreManager {
    fn capacity(&self) -> usize {
        self.config
            .capacity()
            .saturating_sub(self.config.write_offset)
    }

    fn allocate(&mut self, session_index: u8, descriptor: u32, layout: FragLayout) -> Result<BlockOptions> {
        if let Some(previous) = self.open.take() {
            info!(
                session = previous.index,
                descriptor = previous.descriptor,
                "releasing block store of previous session"
            );
        }

        if layout.nb_frag == 0 || layout.frag_size == 0 {
            return Err(Error::storage("Session has no fragments to store"));
        }
        let capacity = self.capacity();
        if layout.stored_size() > capacity {
            return Err(Error::storage(format!(
                "Session needs {} bytes, store holds {}",
                layout.stored_size(),
                capacity
            )));
        }

        let id = self.next_id();
        let options = BlockOptions {
            capacity,
            redundancy: self.config.redundancy,
            store: StoreHandle(id),
            assembler: AssemblerHandle(id),
        };
        let store = BlockStore::new(self.config.block_size, self.config.block_count);
        let assembler = FragmentAssembler::new(layout, self.config.write_offset, self.config.redundancy);

        debug!(
            session = session_index,
            nb_frag = layout.nb_frag,
            frag_size = layout.frag_size,
            handle = id,
            "allocated block store"
        );
        self.open = Some(ReassemblySession {
            index: session_index,
            descriptor,
            options,
            store,
            assembler,
        });
        Ok(options)
    }

    fn release(&mut self, store: StoreHandle) -> bool {
        if self.is_live(store) {
            self.open = None;
            debug!(handle = store.0, "released block store");
            true
        } else {
            false
        }
    }

    fn write_fragment(&mut self, assembler: AssemblerHandle, n: u16, payload: &[u8]) -> Result<AssemblyStatus> {
        match self.open.as_mut() {
            Some(session) if session.options.assembler == assembler => {
                session.assembler.push(&mut session.store, n, payload)
            }
            _ => {
                warn!(handle = assembler.0, "fragment for released assembler");
                Err(Error::storage(format!("Assembler {} is not live", assembler.0)))
            }
        }
    }

    fn progress(&self, assembler: AssemblerHandle) -> Option<AssemblyProgress> {
        self.session_for(assembler).map(|s| s.assembler.progress())
    }

    fn read(&self, store: StoreHandle, len: usize) -> Result<Bytes> {
        let session = self
            .open
            .as_ref()
            .filter(|s| s.options.store == store)
            .ok_or_else(|| Error::storage(format!("Store {} is not live", store.0)))?;
        if len > session.options.capacity {
            return Err(Error::storage(format!(
                "Read of {} bytes exceeds capacity {}",
                len, session.options.capacity
            )));
        }
        let mut buf = vec![0u8; len];
        session.store.read(self.config.write_offset, &mut buf)?;
        Ok(Bytes::from(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> StorageConfig {
        StorageConfig {
            block_size: 16,
            block_count: 4,
            redundancy: 4,
            write_offset: 16,
        }
    }

    fn layout(nb_frag: u16) -> FragLayout {
        FragLayout {
            nb_frag,
            frag_size: 8,
            padding: 0,
        }
    }

    #[test]
    fn test_capacity_excludes_offset() {
        let manager = BlockStoreManager::new(config());
        assert_eq!(manager.capacity(), 48);
    }

    #[test]
    fn test_allocate_and_assemble() {
        let mut manager = BlockStoreManager::new(config());
        let options = manager.allocate(0, 0xCAFE_BABE, layout(2)).unwrap();
        assert_eq!(options.capacity, 48);
        assert_eq!(options.redundancy, 4);
        assert!(manager.is_live(options.store));

        let status = manager.write_fragment(options.assembler, 2, &[2u8; 8]).unwrap();
        assert_eq!(status, AssemblyStatus::InProgress { missing: 1 });
        let status = manager.write_fragment(options.assembler, 1, &[1u8; 8]).unwrap();
        assert_eq!(status, AssemblyStatus::Complete);

        let image = manager.read(options.store, 16).unwrap();
        assert_eq!(&image[..8], &[1u8; 8]);
        assert_eq!(&image[8..], &[2u8; 8]);
        assert!(manager.read(options.store, 49).is_err());

        let progress = manager.progress(options.assembler).unwrap();
        assert_eq!(progress.received, 2);
        assert!(progress.complete);
    }

    #[test]
    fn test_new_allocation_releases_previous() {
        let mut manager = BlockStoreManager::new(config());
        let first = manager.allocate(0, 1, layout(2)).unwrap();
        let second = manager.allocate(1, 2, layout(3)).unwrap();

        assert_ne!(first.store, second.store);
        assert!(!manager.is_live(first.store));
        assert!(manager.is_live(second.store));
        assert!(manager.write_fragment(first.assembler, 1, &[0u8; 8]).is_err());
        assert!(manager.progress(first.assembler).is_none());
        assert!(!manager.release(first.store));
        assert_eq!(manager.session().map(|s| s.index), Some(1));
    }

    #[test]
    fn test_release() {
        let mut manager = BlockStoreManager::new(config());
        let options = manager.allocate(2, 7, layout(1)).unwrap();
        assert!(manager.release(options.store));
        assert!(!manager.release(options.store));
        assert!(manager.session().is_none());
        assert!(manager.read(options.store, 1).is_err());
    }

    #[test]
    fn test_oversized_session_rejected() {
        let mut manager = BlockStoreManager::new(config());
        assert!(manager.allocate(0, 0, layout(7)).is_err());
        assert!(manager.allocate(0, 0, layout(0)).is_err());
        assert!(manager.session().is_none());
        assert!(manager.allocate(0, 0, layout(6)).is_ok());
    }
}
