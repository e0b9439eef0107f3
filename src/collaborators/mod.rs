// THEORY:
// Collaborators are everything the grader talks to but does not own: where the
// video comes from, where workers find the staged copy, where artifacts are
// published, the external classifier and the progress tracker. Each is a trait
// so the pipeline can be driven by local, in-process implementations in tests
// and by real services in production.
//
// The traits are shaped by their failure contracts rather than by any
// particular vendor: staging can be observed before it is committed, uploads
// overwrite, the classifier is never trusted to be up, and progress is
// fire-and-forget.

pub mod classifier;
pub mod progress;
pub mod source;
pub mod staging;
pub mod storage;

pub use classifier::{Classification, VisualClassifier};
pub use progress::{NullProgressSink, ProgressSink, TracingProgressSink};
pub use source::{FrameDirectoryIngress, FrameDirectorySource, FrameReader, InMemorySource, VideoIngress, VideoSource};
pub use staging::{MemoryStaging, StagingArea};
pub use storage::{LocalObjectStore, ObjectStore};
