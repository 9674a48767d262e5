pub(crate) mod call;
pub(crate) mod plugins;
pub(crate) mod serve;
