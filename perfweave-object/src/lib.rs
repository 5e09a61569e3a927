mod buildid;
mod object;

pub use object::code_hash;
pub use object::ObjectError;
pub use object::ObjectFile;

pub use buildid::BuildId;
