use crate::block::RuntimeBlock;
use crate::types::BlockKey;
use std::rc::Rc;

/// Maximum number of blocks live at once.
pub const MAX_STACK_DEPTH: usize = 10;

/// The canonical LIFO of active blocks. A block is on this stack iff it
/// is mounted and not yet unmounted. Mutation happens only through the
/// driver.
#[derive(Default)]
pub struct BlockStack {
    blocks: Vec<Rc<RuntimeBlock>>,
}

impl BlockStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn depth(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_full(&self) -> bool {
        self.blocks.len() >= MAX_STACK_DEPTH
    }

    pub(crate) fn push(&mut self, block: Rc<RuntimeBlock>) {
        self.blocks.push(block);
    }

    pub(crate) fn pop(&mut self) -> Option<Rc<RuntimeBlock>> {
        self.blocks.pop()
    }

    pub fn top(&self) -> Option<&Rc<RuntimeBlock>> {
        self.blocks.last()
    }

    /// Bottom-up iteration (root first).
    pub fn iter(&self) -> impl Iterator<Item = &Rc<RuntimeBlock>> {
        self.blocks.iter()
    }

    /// Snapshot in top-down order (innermost first).
    pub fn top_down(&self) -> Vec<Rc<RuntimeBlock>> {
        self.blocks.iter().rev().cloned().collect()
    }

    pub fn contains(&self, key: BlockKey) -> bool {
        self.blocks.iter().any(|b| b.key() == key)
    }

    /// The block immediately beneath the one identified by `key`.
    pub fn beneath(&self, key: BlockKey) -> Option<&Rc<RuntimeBlock>> {
        let position = self.blocks.iter().position(|b| b.key() == key)?;
        position.checked_sub(1).map(|i| &self.blocks[i])
    }
}
