mod master;

pub use master::MasterSyncService;
