pub(crate) mod connectors;
pub(crate) mod jobs;
pub(crate) mod store;
