//! Acquisition pipeline for Sentinel-2 products: query a metadata catalog
//! for an area of interest, pick the best candidate, resolve its tile
//! prefix in the public object store, and download every file of the
//! product concurrently with resume and integrity checking.
#![allow(async_fn_in_trait)]

pub mod aoi;
pub mod catalog;
pub mod config;
pub mod error;
pub mod listing;
pub mod pipeline;
pub mod retry;
pub mod scheduler;
pub mod selection;
pub mod store;
pub mod tile;
pub mod verify;
