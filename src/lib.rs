/*!
Resolver for undocumented XNU kernel structures on arm64.

Field offsets are picked per Darwin version, un-exported arrays are found by
scanning the kernelcache for the code that uses them, and the structures
themselves are copied out of live kernel memory read through memflow.
*/

pub mod arm64;
pub mod image;
pub mod kernel;
pub mod locator;
pub mod memory;
pub mod nonce;
pub mod offsets;
pub mod osobject;
pub mod pointer;
pub mod sig;
pub mod version;

pub use image::{macho::MachoImage, Patchfinder, Section, SectionRef, SectionScanner};
pub use kernel::Kernel;
pub use locator::{ImageSections, NonceTableLayout, ResolvedArray, SignatureLocator};
pub use memory::{KernelMemory, MemflowView, SparseMemory};
pub use nonce::{
    DomainSlotDecoder, NonceDescriptor, NonceDomain, NonceSlot, NonceTable,
    CRYPTEX_BOOT_ENTITLEMENT,
};
pub use offsets::{OffsetTable, OsValueKind};
pub use osobject::{DictValue, ObjectWalker};
pub use pointer::PointerNormalizer;
pub use version::{KernelBuild, KernelVersion, VersionRange};
