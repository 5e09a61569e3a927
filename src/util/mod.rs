mod file;
mod wait;

pub use file::add_permission_dir;
pub use file::copy_dir_all;
pub use file::resolve_proc_root_links;
pub use wait::find_by_prefix;
pub use wait::wait_for_file;
pub use wait::wait_for_file_by_prefix;
pub use wait::WaitError;
pub use wait::POLL_INTERVAL;
