//! `BlockFactor` (spec §3): per-cell assignment to a sample/batch level.

/// Maps each cell to a block (sample) index, plus the block-level label
/// vector. Absent means all cells are in one implicit block.
#[derive(Debug, Clone)]
pub struct BlockFactor {
    pub levels: Vec<String>,
    pub indices: Vec<u32>,
}

impl BlockFactor {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn n_blocks(&self) -> usize {
        self.levels.len()
    }

    pub fn select(&self, keep: &[u32]) -> BlockFactor {
        BlockFactor {
            levels: self.levels.clone(),
            indices: keep.iter().map(|&i| self.indices[i as usize]).collect(),
        }
    }

    pub fn from_labels(labels: &[String]) -> BlockFactor {
        let mut levels: Vec<String> = Vec::new();
        let mut indices = Vec::with_capacity(labels.len());
        for label in labels {
            let pos = levels.iter().position(|l| l == label);
            let id = match pos {
                Some(p) => p as u32,
                None => {
                    levels.push(label.clone());
                    (levels.len() - 1) as u32
                }
            };
            indices.push(id);
        }
        BlockFactor { levels, indices }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_labels_assigns_first_appearance_levels() {
        let labels = vec!["d2".to_string(), "d1".to_string(), "d2".to_string()];
        let block = BlockFactor::from_labels(&labels);
        assert_eq!(block.levels, vec!["d2", "d1"]);
        assert_eq!(block.indices, vec![0, 1, 0]);
    }

    #[test]
    fn select_reindexes_to_retained_cells() {
        let block = BlockFactor {
            levels: vec!["a".into(), "b".into()],
            indices: vec![0, 1, 0, 1],
        };
        let sub = block.select(&[1, 2]);
        assert_eq!(sub.indices, vec![1, 0]);
        assert_eq!(sub.levels, block.levels);
    }
}
