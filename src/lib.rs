#![forbid(unsafe_code)]

//! Shared library behind the relaytube binaries.
//!
//! `collector` turns subreddit listings into Post Folders on disk, `uploader`
//! republishes finished folders to YouTube, and `authorize` performs the
//! one-time OAuth consent. The folder tree is the only thing the two
//! long-running processes share.

pub mod auth;
pub mod collector;
pub mod config;
pub mod downloader;
pub mod fetcher;
pub mod ledger;
pub mod logging;
pub mod post_folder;
pub mod reddit;
pub mod security;
pub mod uploader;
pub mod youtube;
