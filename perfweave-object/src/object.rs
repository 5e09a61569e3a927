use std::fs;
use std::fs::File;
use std::io;
use std::path::Path;

use memmap2::Mmap;
use ring::digest::{digest, Digest, SHA256};
use thiserror::Error;

use object::elf::{FileHeader32, FileHeader64, PT_DYNAMIC, PT_INTERP};
use object::read::elf::FileHeader;
use object::read::elf::ProgramHeader;
use object::Endianness;
use object::FileKind;
use object::Object;
use object::ObjectSection;
use object::ObjectSymbol;

use crate::BuildId;

/// Go strings are a (pointer, length) pair of machine words.
const GO_STRING_HEADER_SIZE: u64 = 16;
const GO_BUILD_VERSION_SYMBOL: &str = "runtime.buildVersion";

#[derive(Debug, Error)]
pub enum ObjectError {
    #[error("failed to read object file: {0}")]
    Io(#[from] io::Error),
    #[error("failed to parse object file: {0}")]
    Parse(#[from] object::Error),
    #[error("object is not a 32 or 64 bits ELF but {0:?}")]
    NotElf(FileKind),
    #[error("object has neither a build id nor a .text section")]
    NoBuildId,
}

impl ObjectError {
    /// Whether the file went away, which for `/proc/<pid>/exe` means the
    /// process exited.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ObjectError::Io(e) if e.kind() == io::ErrorKind::NotFound)
    }
}

#[derive(Debug)]
pub struct ObjectFile {
    /// Warning! `object` must always go above `mmap` to ensure it will be dropped
    /// before. Rust guarantees that fields are dropped in the order they are defined.
    object: object::File<'static>, // Its lifetime is tied to the `mmap` below.
    mmap: Box<Mmap>,
    build_id: BuildId,
}

impl ObjectFile {
    pub fn new(file: &File) -> Result<Self, ObjectError> {
        // Rust offers no guarantees on whether a "move" is done virtually or by memcpying,
        // so to ensure that the memory value is valid we store it in the heap.
        // Safety: Memory mapping files can cause issues if the file is modified or unmapped.
        let mmap = Box::new(unsafe { Mmap::map(file) }?);
        let object = object::File::parse(&**mmap)?;
        // Safety: The lifetime of `object` will outlive `mmap`'s. We ensure `mmap` lives as long as
        // `object` by defining `object` before.
        let object =
            unsafe { std::mem::transmute::<object::File<'_>, object::File<'static>>(object) };
        let build_id = Self::read_build_id(&object)?;

        Ok(ObjectFile {
            object,
            mmap,
            build_id,
        })
    }

    pub fn from_path(path: &Path) -> Result<Self, ObjectError> {
        let file = fs::File::open(path)?;
        Self::new(&file)
    }

    pub fn build_id(&self) -> &BuildId {
        &self.build_id
    }

    /// Returns the GNU or Go build id if present, otherwise the hash of the
    /// text section.
    fn read_build_id(object: &object::File<'static>) -> Result<BuildId, ObjectError> {
        if let Some(data) = object.build_id()? {
            return Ok(BuildId::gnu_from_bytes(data));
        }

        for section in object.sections() {
            if section.name()? != ".note.go.buildid" {
                continue;
            }
            if let Ok(data) = section.data() {
                return Ok(BuildId::go_from_bytes(data));
            }
        }

        match code_hash(object) {
            Some(code_hash) => Ok(BuildId::sha256_from_digest(&code_hash)),
            None => Err(ObjectError::NoBuildId),
        }
    }

    pub fn is_go(&self) -> bool {
        self.object.sections().any(|section| {
            matches!(
                section.name(),
                Ok(".gosymtab") | Ok(".gopclntab") | Ok(".note.go.buildid")
            )
        })
    }

    /// An executable is statically linked when it neither asks for an
    /// interpreter nor carries a dynamic segment.
    pub fn is_statically_linked(&self) -> Result<bool, ObjectError> {
        let mmap = &**self.mmap;
        let segment_types = match FileKind::parse(mmap)? {
            FileKind::Elf32 => segment_types::<FileHeader32<Endianness>>(mmap)?,
            FileKind::Elf64 => segment_types::<FileHeader64<Endianness>>(mmap)?,
            other_file_kind => return Err(ObjectError::NotElf(other_file_kind)),
        };

        Ok(!segment_types
            .iter()
            .any(|p_type| *p_type == PT_INTERP || *p_type == PT_DYNAMIC))
    }

    /// Reads `size` bytes at the address of the given symbol, looking at both
    /// the static and the dynamic symbol tables.
    pub fn symbol_data(&self, name: &str, size: u64) -> Option<&[u8]> {
        let symbol = self
            .object
            .symbols()
            .chain(self.object.dynamic_symbols())
            .find(|symbol| matches!(symbol.name(), Ok(symbol_name) if symbol_name == name))?;

        self.read_virtual_address(symbol.address(), size)
    }

    /// Reads `size` bytes from whichever section contains the virtual address.
    pub fn read_virtual_address(&self, address: u64, size: u64) -> Option<&[u8]> {
        self.object
            .sections()
            .find_map(|section| section.data_range(address, size).ok().flatten())
    }

    /// The toolchain version a Go binary was built with, e.g. `go1.21.4`.
    pub fn go_build_version(&self) -> Option<String> {
        let header = self.symbol_data(GO_BUILD_VERSION_SYMBOL, GO_STRING_HEADER_SIZE)?;
        let (pointer, length) = header.split_at(8);
        let (pointer, length) = if self.object.is_little_endian() {
            (
                u64::from_le_bytes(pointer.try_into().ok()?),
                u64::from_le_bytes(length.try_into().ok()?),
            )
        } else {
            (
                u64::from_be_bytes(pointer.try_into().ok()?),
                u64::from_be_bytes(length.try_into().ok()?),
            )
        };

        let version = self.read_virtual_address(pointer, length)?;
        Some(String::from_utf8_lossy(version).into_owned())
    }
}

fn segment_types<Elf: FileHeader<Endian = Endianness>>(data: &[u8]) -> Result<Vec<u32>, ObjectError> {
    let header = Elf::parse(data)?;
    let endian = header.endian()?;
    let segments = header.program_headers(endian, data)?;
    Ok(segments.iter().map(|segment| segment.p_type(endian)).collect())
}

pub fn code_hash(object: &object::File) -> Option<Digest> {
    object
        .sections()
        .filter(|section| matches!(section.name(), Ok(".text")))
        .find_map(|section| section.data().ok())
        .map(|data| digest(&SHA256, data))
}
