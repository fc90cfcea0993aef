pub mod versioned_schema;
