pub(crate) mod facade;
pub(crate) mod fallback;
pub(crate) mod free_list;
pub(crate) mod handoff;
pub(crate) mod header;
pub(crate) mod loom_tests;
pub(crate) mod size_class;
pub(crate) mod source;
pub(crate) mod stats;
