pub mod accumulate;
pub mod backfill;
pub mod db;
pub mod fetch;
pub mod normalize;
pub mod providers;
pub mod range;
pub mod tenant;
pub mod windows;
