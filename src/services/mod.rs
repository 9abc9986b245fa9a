//! Object store, grant signing, thumbnail cache and the gallery router.

pub mod gallery_service;
pub mod object_store;
pub mod signer;
pub mod storage_service;
pub mod thumbnail_service;
