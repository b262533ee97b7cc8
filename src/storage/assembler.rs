//! Fragment assembler for the fragmented data block transport
//!
//! Fragments `1..=nb_frag` carry the image uncoded. Fragments above `nb_frag`
//! are parity fragments: the XOR of the uncoded fragments selected by a
//! pseudo-random row of the LoRaWAN parity-check matrix. Lost uncoded
//! fragments are recovered by Gaussian elimination over GF(2) once enough
//! parity fragments are buffered.

use tracing::{debug, trace};

use super::block::BlockStore;
use crate::core::{Error, Result};

/// Geometry of one fragmentation session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragLayout {
    /// Number of uncoded fragments
    pub nb_frag: u16,
    /// Bytes per fragment
    pub frag_size: usize,
    /// Padding bytes appended to the last uncoded fragment
    pub padding: u8,
}

impl FragLayout {
    /// Bytes occupied in the block store
    pub fn stored_size(&self) -> usize {
        self.nb_frag as usize * self.frag_size
    }

    /// Bytes of the image once padding is stripped
    pub fn image_size(&self) -> usize {
        self.stored_size().saturating_sub(self.padding as usize)
    }
}

/// Result of feeding one fragment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblyStatus {
    /// More fragments are needed
    InProgress { missing: u16 },
    /// Fragment was already known
    Duplicate,
    /// Every uncoded fragment is in the store
    Complete,
}

/// Counters reported in a session status answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssemblyProgress {
    /// Fragments accepted so far, uncoded and parity
    pub received: u16,
    /// Uncoded fragments still unknown
    pub missing: u16,
    /// Parity fragments were dropped for lack of buffer
    pub redundancy_exhausted: bool,
    pub complete: bool,
}

#[derive(Debug)]
struct ParityRow {
    line: Vec<bool>,
    data: Vec<u8>,
}

/// Reassembles one session into a [`BlockStore`]
#[derive(Debug)]
pub struct FragmentAssembler {
    layout: FragLayout,
    /// Store address of fragment 1
    base: usize,
    redundancy: usize,
    known: Vec<bool>,
    missing: usize,
    parity: Vec<ParityRow>,
    received: u16,
    redundancy_exhausted: bool,
}

impl FragmentAssembler {
    /// Creates an assembler writing fragment `n` at `base + (n - 1) * frag_size`
    pub fn new(layout: FragLayout, base: usize, redundancy: usize) -> Self {
        FragmentAssembler {
            layout,
            base,
            redundancy,
            known: vec![false; layout.nb_frag as usize],
            missing: layout.nb_frag as usize,
            parity: Vec::new(),
            received: 0,
            redundancy_exhausted: false,
        }
    }

    pub fn layout(&self) -> FragLayout {
        self.layout
    }

    pub fn is_complete(&self) -> bool {
        self.missing == 0
    }

    pub fn progress(&self) -> AssemblyProgress {
        AssemblyProgress {
            received: self.received,
            missing: self.missing as u16,
            redundancy_exhausted: self.redundancy_exhausted,
            complete: self.is_complete(),
        }
    }

    /// Feeds fragment `n` (1-based)
    pub fn push(&mut self, store: &mut BlockStore, n: u16, payload: &[u8]) -> Result<AssemblyStatus> {
        if payload.len() != self.layout.frag_size {
            return Err(Error::protocol(format!(
                "Fragment {} has {} bytes, session uses {}",
                n,
                payload.len(),
                self.layout.frag_size
            )));
        }
        if n == 0 {
            return Err(Error::protocol("Fragment numbers start at 1"));
        }
        if self.is_complete() {
            return Ok(AssemblyStatus::Complete);
        }

        let nb_frag = self.layout.nb_frag;
        if n <= nb_frag {
            let index = (n - 1) as usize;
            if self.known[index] {
                return Ok(AssemblyStatus::Duplicate);
            }
            store.program(self.address(index), payload)?;
            self.known[index] = true;
            self.missing -= 1;
        } else {
            let line = matrix_line((n - nb_frag) as u32, nb_frag as usize);
            let useful = line
                .iter()
                .zip(&self.known)
                .any(|(bit, known)| *bit && !known);
            if !useful {
                trace!(n, "parity fragment covers no missing fragment");
            } else if self.parity.len() >= self.redundancy {
                self.redundancy_exhausted = true;
                debug!(n, budget = self.redundancy, "parity buffer full, fragment dropped");
            } else {
                self.parity.push(ParityRow {
                    line,
                    data: payload.to_vec(),
                });
            }
        }
        self.received = self.received.saturating_add(1);

        if self.missing > 0 && self.parity.len() >= self.missing {
            self.recover(store)?;
        }

        if self.is_complete() {
            Ok(AssemblyStatus::Complete)
        } else {
            Ok(AssemblyStatus::InProgress {
                missing: self.missing as u16,
            })
        }
    }

    fn address(&self, index: usize) -> usize {
        self.base + index * self.layout.frag_size
    }

    /// Solves the buffered parity rows for the missing fragments
    fn recover(&mut self, store: &mut BlockStore) -> Result<bool> {
        let frag_size = self.layout.frag_size;
        let missing: Vec<usize> = (0..self.known.len()).filter(|&j| !self.known[j]).collect();

        // Fold known fragments into each row so only unknowns remain
        let mut scratch = vec![0u8; frag_size];
        let mut rows: Vec<(Vec<bool>, Vec<u8>)> = Vec::with_capacity(self.parity.len());
        for row in &self.parity {
            let mut data = row.data.clone();
            for (j, bit) in row.line.iter().enumerate() {
                if *bit && self.known[j] {
                    store.read(self.address(j), &mut scratch)?;
                    xor_into(&mut data, &scratch);
                }
            }
            let bits: Vec<bool> = missing.iter().map(|&j| row.line[j]).collect();
            if bits.iter().any(|b| *b) {
                rows.push((bits, data));
            }
        }

        let mut rank = 0;
        for col in 0..missing.len() {
            let pivot = match (rank..rows.len()).find(|&r| rows[r].0[col]) {
                Some(pivot) => pivot,
                None => {
                    trace!(rows = rows.len(), missing = missing.len(), "parity rows not yet independent");
                    return Ok(false);
                }
            };
            rows.swap(rank, pivot);
            let (pivot_bits, pivot_data) = rows[rank].clone();
            for (r, (bits, data)) in rows.iter_mut().enumerate() {
                if r != rank && bits[col] {
                    for (b, p) in bits.iter_mut().zip(&pivot_bits) {
                        *b ^= *p;
                    }
                    xor_into(data, &pivot_data);
                }
            }
            rank += 1;
        }

        for (k, &index) in missing.iter().enumerate() {
            store.program(self.address(index), &rows[k].1)?;
            self.known[index] = true;
        }
        debug!(recovered = missing.len(), parity = self.parity.len(), "missing fragments recovered");
        self.missing = 0;
        self.parity.clear();
        Ok(true)
    }
}

fn xor_into(dst: &mut [u8], src: &[u8]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d ^= *s;
    }
}

/// 23-bit pseudo-random binary sequence step
fn prbs23(x: u32) -> u32 {
    let b0 = x & 1;
    let b1 = (x & 32) >> 5;
    (x >> 1) | ((b0 ^ b1) << 22)
}

/// Row `n` (1-based) of the parity-check matrix for `m` uncoded fragments
///
/// Draws `m / 2` coefficients; a column drawn twice stays set, so a row may
/// cover fewer fragments. When `m` is a power of two the modulus is widened
/// by one.
pub(crate) fn matrix_line(n: u32, m: usize) -> Vec<bool> {
    let mut line = vec![false; m];
    let modulus = if m.is_power_of_two() { m + 1 } else { m };
    let mut x = 1 + 1001 * n;

    for _ in 0..m / 2 {
        let mut r = m;
        while r >= m {
            x = prbs23(x);
            r = x as usize % modulus;
        }
        line[r] = true;
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(nb_frag: u16, frag_size: usize) -> Vec<u8> {
        (0..nb_frag as usize * frag_size).map(|i| (i * 7 + 3) as u8).collect()
    }

    fn fragment(image: &[u8], frag_size: usize, n: u16) -> Vec<u8> {
        let start = (n as usize - 1) * frag_size;
        image[start..start + frag_size].to_vec()
    }

    fn parity_fragment(image: &[u8], layout: FragLayout, n: u16) -> Vec<u8> {
        let line = matrix_line((n - layout.nb_frag) as u32, layout.nb_frag as usize);
        let mut out = vec![0u8; layout.frag_size];
        for (j, bit) in line.iter().enumerate() {
            if *bit {
                xor_into(&mut out, &fragment(image, layout.frag_size, j as u16 + 1));
            }
        }
        out
    }

    #[test]
    fn test_matrix_line_known_rows() {
        let bits = |line: Vec<bool>| line.into_iter().map(u8::from).collect::<Vec<_>>();
        assert_eq!(bits(matrix_line(1, 8)), vec![1, 1, 0, 0, 1, 0, 1, 0]);
        assert_eq!(bits(matrix_line(2, 8)), vec![1, 0, 0, 0, 1, 0, 0, 1]);
        assert_eq!(bits(matrix_line(1, 10)), vec![0, 0, 1, 0, 0, 1, 0, 0, 0, 0]);
        assert_eq!(bits(matrix_line(3, 10)), vec![0, 1, 0, 1, 0, 1, 1, 1, 0, 0]);
        // repeated draws land on the same column
        assert_eq!(bits(matrix_line(7, 4)), vec![0, 0, 0, 1]);
        assert!(matrix_line(1, 1).iter().all(|b| !b));
    }

    #[test]
    fn test_uncoded_out_of_order() {
        let layout = FragLayout { nb_frag: 8, frag_size: 4, padding: 0 };
        let data = image(8, 4);
        let mut store = BlockStore::new(16, 2);
        let mut assembler = FragmentAssembler::new(layout, 0, 4);

        for n in [3u16, 1, 8, 5, 2, 7, 6] {
            let status = assembler.push(&mut store, n, &fragment(&data, 4, n)).unwrap();
            assert!(matches!(status, AssemblyStatus::InProgress { .. }));
        }
        assert_eq!(assembler.progress().missing, 1);
        assert_eq!(
            assembler.push(&mut store, 3, &fragment(&data, 4, 3)).unwrap(),
            AssemblyStatus::Duplicate
        );

        let status = assembler.push(&mut store, 4, &fragment(&data, 4, 4)).unwrap();
        assert_eq!(status, AssemblyStatus::Complete);

        let mut out = vec![0u8; data.len()];
        store.read(0, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_recovers_lost_fragments_from_parity() {
        let layout = FragLayout { nb_frag: 10, frag_size: 4, padding: 0 };
        let data = image(10, 4);
        let mut store = BlockStore::new(64, 1);
        let mut assembler = FragmentAssembler::new(layout, 8, 10);

        for n in (1..=10u16).filter(|n| *n != 4 && *n != 8) {
            assembler.push(&mut store, n, &fragment(&data, 4, n)).unwrap();
        }
        assert_eq!(assembler.progress().missing, 2);

        let mut completed_at = None;
        for n in 11..=20u16 {
            let status = assembler
                .push(&mut store, n, &parity_fragment(&data, layout, n))
                .unwrap();
            if status == AssemblyStatus::Complete {
                completed_at = Some(n);
                break;
            }
        }
        assert!(completed_at.is_some(), "parity fragments should cover two losses");

        let mut out = vec![0u8; data.len()];
        store.read(8, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_recovers_random_losses() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(0x5EED);
        let layout = FragLayout { nb_frag: 20, frag_size: 16, padding: 0 };
        let data: Vec<u8> = (0..layout.stored_size()).map(|_| rng.gen()).collect();

        for _ in 0..10 {
            let lost = rand::seq::index::sample(&mut rng, 20, 3).into_vec();
            let mut store = BlockStore::new(64, 8);
            let mut assembler = FragmentAssembler::new(layout, 0, 20);

            for n in 1..=20u16 {
                if !lost.contains(&(n as usize - 1)) {
                    assembler.push(&mut store, n, &fragment(&data, 16, n)).unwrap();
                }
            }
            for n in 21..=40u16 {
                assembler
                    .push(&mut store, n, &parity_fragment(&data, layout, n))
                    .unwrap();
                if assembler.is_complete() {
                    break;
                }
            }
            assert!(assembler.is_complete(), "lost {:?}", lost);

            let mut out = vec![0u8; data.len()];
            store.read(0, &mut out).unwrap();
            assert_eq!(out, data);
        }
    }

    #[test]
    fn test_redundancy_budget() {
        let layout = FragLayout { nb_frag: 10, frag_size: 2, padding: 0 };
        let data = image(10, 2);
        let mut store = BlockStore::new(32, 1);
        let mut assembler = FragmentAssembler::new(layout, 0, 1);

        for n in 1..=7u16 {
            assembler.push(&mut store, n, &fragment(&data, 2, n)).unwrap();
        }
        for n in 11..=14u16 {
            assembler
                .push(&mut store, n, &parity_fragment(&data, layout, n))
                .unwrap();
        }

        let progress = assembler.progress();
        assert!(progress.redundancy_exhausted);
        assert!(!progress.complete);
        assert_eq!(progress.received, 11);
    }

    #[test]
    fn test_rejects_bad_fragments() {
        let layout = FragLayout { nb_frag: 2, frag_size: 4, padding: 1 };
        assert_eq!(layout.image_size(), 7);

        let mut store = BlockStore::new(8, 1);
        let mut assembler = FragmentAssembler::new(layout, 0, 2);
        assert!(assembler.push(&mut store, 1, &[0u8; 3]).is_err());
        assert!(assembler.push(&mut store, 0, &[0u8; 4]).is_err());
        assert_eq!(assembler.progress().received, 0);
    }
}
