//! Module tree traversal and attention strategy selection.
//!
//! Every layer type implements [`Module`]. Attention-capable modules expose
//! their [`AttentionStrategy`] through [`Module::attention_strategy_mut`];
//! everything else returns `None` and is walked through without change.

use crate::config::AttentionStrategy;

/// A node in the model's module tree.
pub trait Module {
    /// Type name of the module, aligned with the Transformers class name.
    fn name(&self) -> &'static str;

    /// Direct children, in declaration order.
    fn children_mut(&mut self) -> Vec<&mut dyn Module> {
        Vec::new()
    }

    /// Strategy slot of an attention-capable module.
    fn attention_strategy_mut(&mut self) -> Option<&mut AttentionStrategy> {
        None
    }
}

/// Set `strategy` on every attention module under `root`.
///
/// The walk is post-order with children visited last-to-first; each module is
/// updated independently, so the order is not observable.
pub fn set_attention_strategy(root: &mut dyn Module, strategy: AttentionStrategy) {
    for child in root.children_mut().into_iter().rev() {
        set_attention_strategy(child, strategy);
    }

    let name = root.name();
    if let Some(slot) = root.attention_strategy_mut() {
        let current = *slot;
        if current != strategy {
            tracing::debug!(
                module = name,
                from = ?current,
                to = ?strategy,
                "switching attention strategy"
            );
        }
        *slot = strategy;
    }
}

/// Switch every attention layer under `root` to position-shifted attention.
pub fn enable_pos_shift_attention(root: &mut dyn Module) {
    set_attention_strategy(root, AttentionStrategy::PositionShifted);
}
