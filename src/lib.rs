pub mod clustering;
pub mod db;
pub mod logging;

pub const TARGET_DB: &str = "db_query";
pub const TARGET_PIPELINE: &str = "pipeline";
pub const TARGET_LLM_REQUEST: &str = "llm_request";
