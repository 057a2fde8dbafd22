pub mod api_util;
pub mod auto_fetch;
pub mod cache;
pub mod cipher_util;
pub mod dashboard;
pub mod economy;
pub mod environment;
pub mod pre_event;
pub mod round2;
pub mod runtime;
pub mod scoring;
pub mod stat;
