//! rwmd - RimWorld Workshop Mod Downloader
//!
//! Downloads Steam Workshop mods through SteamCMD, moves them into the
//! active mods folder and checks game version and dependency metadata
//! scraped from the Workshop page on the way.

pub mod config;
pub mod orchestrator;
pub mod processor;
pub mod progress;
pub mod queue;
pub mod steamcmd;
pub mod types;
pub mod workshop;
