pub mod thread_context;
