pub(crate) mod analysis;
pub(crate) mod cfg;
pub(crate) mod expression;
pub(crate) mod store;
pub(crate) mod transfer;
