pub mod youtube_analytics;
pub mod youtube_data;
