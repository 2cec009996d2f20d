use std::collections::BTreeMap;

/// Reassembly buffer for one fragmented packet.
///
/// The buffer tracks which byte ranges are still missing as a sorted map of disjoint `[start,
/// end)` ranges. Bytes which arrive again for positions already received must match what was
/// stored; otherwise the fragment is assumed to belong to a different packet which reused the same
/// identifier, and reassembly starts over from that fragment.
#[derive(Debug)]
pub struct Fragment {
    total_length: usize,
    data: Box<[u8]>,
    // Missing ranges, start -> end
    missing: BTreeMap<usize, usize>,
}

impl Fragment {
    /// Starts a buffer from the fragment at `offset`. Bytes beyond `total_length` are ignored.
    pub fn new(total_length: usize, offset: usize, bytes: &[u8]) -> Self {
        let mut data = vec![0; total_length].into_boxed_slice();
        let mut missing = BTreeMap::new();

        let start = offset.min(total_length);
        let end = offset.saturating_add(bytes.len()).min(total_length);

        data[start..end].copy_from_slice(&bytes[..end - start]);

        if start == end {
            if total_length > 0 {
                missing.insert(0, total_length);
            }
        } else {
            if start > 0 {
                missing.insert(0, start);
            }
            if end < total_length {
                missing.insert(end, total_length);
            }
        }

        Self {
            total_length,
            data,
            missing,
        }
    }

    /// Merges another fragment of the same packet into the buffer.
    pub fn add(&mut self, total_length: usize, offset: usize, bytes: &[u8]) {
        let end = offset.saturating_add(bytes.len());

        if total_length != self.total_length || end > self.total_length {
            *self = Self::new(total_length, offset, bytes);
            return;
        }

        // Nothing to merge, and splitting a missing range around it would leave two touching ranges
        if bytes.is_empty() {
            return;
        }

        let overlapping: Vec<(usize, usize)> = self
            .missing
            .range(..end)
            .filter(|&(_, &range_end)| range_end > offset)
            .map(|(&start, &end)| (start, end))
            .collect();

        // Everything between missing ranges has been received already and must agree
        let mut cursor = offset;
        for &(start, range_end) in overlapping.iter() {
            if !self.matches(cursor, start.max(offset), offset, bytes) {
                *self = Self::new(total_length, offset, bytes);
                return;
            }
            cursor = range_end.min(end);
        }
        if !self.matches(cursor, end, offset, bytes) {
            *self = Self::new(total_length, offset, bytes);
            return;
        }

        for (start, range_end) in overlapping {
            let copy_start = start.max(offset);
            let copy_end = range_end.min(end);

            self.data[copy_start..copy_end]
                .copy_from_slice(&bytes[copy_start - offset..copy_end - offset]);

            self.missing.remove(&start);

            if start < copy_start {
                self.missing.insert(start, copy_start);
            }
            if copy_end < range_end {
                self.missing.insert(copy_end, range_end);
            }
        }
    }

    fn matches(&self, from: usize, to: usize, offset: usize, bytes: &[u8]) -> bool {
        from >= to || self.data[from..to] == bytes[from - offset..to - offset]
    }

    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }

    pub fn total_length(&self) -> usize {
        self.total_length
    }

    pub fn missing_ranges(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.missing.iter().map(|(&start, &end)| (start, end))
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Box<[u8]> {
        self.data
    }
}
