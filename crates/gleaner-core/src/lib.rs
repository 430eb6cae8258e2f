pub mod detection;
pub mod error;
pub mod interpreter;
pub mod job;
pub mod job_queue;
pub mod locale;
pub mod matcher;
pub mod page;
pub mod resource;
pub mod route;
pub mod testutil;
pub mod text;
pub mod traits;
pub mod transform;

pub use error::AppError;
pub use interpreter::{Interpreter, LoadReadiness, LoadWait, wait_for_load};
pub use job::{
    Job, JobParameters, JobResult, JobSource, ScrapedPage, ServerAutonomy, ServerDefinition,
};
pub use job_queue::JobQueue;
pub use matcher::{MatchedResource, NoMatch, PageCheck, PageDocument, PageMatcher};
pub use page::process_page;
pub use resource::{Payload, Resource, Variables};
pub use traits::{Fetcher, LiveDocument, LogRecord, LogSink, ResourceAllowList, Severity};
