//! Integration tests for the kmsorter pipelines

mod cli_parse;
mod dedup_scenarios;
mod pipeline_flow;
mod support;
