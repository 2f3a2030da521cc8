pub mod analytics_event;
pub mod click_category;
pub mod ingest;
