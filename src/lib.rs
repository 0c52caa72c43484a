//! Installs, identifies, orders and conflict-checks mod units for a host
//! application that reads plain files: a `modinfo.xml` per unit folder, an
//! order file listing ids, and JSON side tables.

pub mod backup;
pub mod cli;
pub mod config;
pub mod conflicts;
pub mod error;
pub mod events;
pub mod extract;
pub mod fsutil;
pub mod installer;
pub mod logging;
pub mod manifest;
pub mod order_file;
pub mod pak;
pub mod profiles;
pub mod prompt;
pub mod unit;
pub mod version;

pub use config::CoreConfig;
pub use conflicts::{ConflictChecker, ConflictGroup, ConflictOwner};
pub use error::CoreError;
pub use events::{CoreEvent, EventSink};
pub use installer::{InstallOutcome, InstallRejection, Installer};
pub use order_file::{OrderEntry, OrderFileManager};
pub use profiles::{Profile, ProfilesService};
pub use prompt::{Headless, NoticeLevel, Prompt};
pub use unit::{ModUnit, VersionRecord};
