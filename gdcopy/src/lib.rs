pub mod config;
pub mod folder_ref;
pub mod ledger;
pub mod remote;
pub mod report;
pub mod runtime;
pub mod session;
pub mod sync;

#[cfg(test)]
mod test_support;
