//! Per-head bookkeeping.

/// One attention head: the slice `[begin, end)` of the joint feature axis it
/// owns and a readable identifier derived from its layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadContext {
    pub index: usize,
    pub name: String,
    pub begin: usize,
    pub end: usize,
}

impl HeadContext {
    pub fn width(&self) -> usize {
        self.end - self.begin
    }
}

/// Lays out `head_num` contiguous, non-overlapping slices in head order.
pub(crate) fn plan_heads(layer_name: &str, head_num: usize, head_dim: usize) -> Vec<HeadContext> {
    (0..head_num)
        .map(|index| HeadContext {
            index,
            name: format!("{layer_name}-Att-{}", index + 1),
            begin: index * head_dim,
            end: (index + 1) * head_dim,
        })
        .collect()
}
