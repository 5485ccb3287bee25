mod call_api;
mod util_api;

pub use call_api::CallController;
