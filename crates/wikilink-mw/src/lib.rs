//! MediaWiki plumbing for the wikilink plugin: title parsing, the api.php
//! gateway, title resolution (with the danger-redirect policy), reply
//! rendering, intro extraction, and the snapshot shellout.

pub mod extract;
pub mod gateway;
pub mod reply;
pub mod resolve;
pub mod snapshot;
pub mod titles;

pub use gateway::{ApiGateway, OpenSearch};
pub use resolve::{resolve, PageBranch, Resolution, TitleOutcome};
pub use titles::TitleQuery;
