// Infrastructure layer - External dependencies and adapters
pub mod chunked_stream;
pub mod clickhouse_executor;
pub mod config;
pub mod http_response;
pub mod table_mapper;
