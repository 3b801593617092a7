//! AWS adapters: S3 object store and DynamoDB persistence.

pub mod dynamodb;
pub mod s3;

pub use dynamodb::DynamoRepository;
pub use s3::S3ObjectStore;
