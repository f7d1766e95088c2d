use crate::image::Patchfinder;
use crate::version::{KernelBuild, VersionRange};

use memflow::prelude::v1::*;

use log::*;

/// Typed value held by an `OSObject` container slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OsValueKind {
    /// `OSData`, raw bytes.
    Data,
    /// `OSString` / `OSSymbol`, NUL terminated characters.
    String,
}

/// Kernel structure field offsets for one kernel build.
///
/// Built once from a baseline layout, the version gated overrides and the
/// fields that can only be resolved against the kernelcache itself. Never
/// mutated afterwards.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OffsetTable {
    pub proc_pid: usize,
    pub proc_task: usize,
    pub proc_list_next: usize,
    pub proc_struct_size: usize,
    pub all_proc: Address,

    pub itk_space: usize,
    pub task_itk_space_table: usize,
    /// The IPC entry table pointer is SMR protected and needs
    /// `PointerNormalizer::normalize_indirect`.
    pub table_smr: bool,
    /// Tag shift parameter of the SMR pointer encoding.
    pub smr: u64,
    pub ipc_entry_object: usize,
    pub ipc_entry_size: usize,
    pub ipc_port_kobject: usize,
    pub ipc_port_kobject_is_iomachport: bool,
    pub iomachport_object: usize,

    /// Width of the pointer tag region, `T1SZ_BOOT`.
    pub t1sz_boot: u32,

    pub io_dt_nvram: usize,
    pub os_dict: usize,
    pub os_dict_size: usize,
    pub os_string: usize,
    pub os_metabase_size: usize,
    pub os_data: usize,
    pub io_aes_accel_special_keys: usize,
    pub io_aes_accel_special_keys_size: usize,
}

type Override = fn(&mut OffsetTable);

/// Version gated overrides, applied in order so later entries win.
///
/// The exact-version entry refines the range it sits inside of and must stay
/// right after it.
fn overrides() -> Vec<(VersionRange, Override)> {
    fn gate(range: VersionRange, apply: Override) -> (VersionRange, Override) {
        (range, apply)
    }

    vec![
        gate(VersionRange::at_least((21, 4, 0)), |o| {
            o.ipc_port_kobject = 0x48;
            o.io_dt_nvram = 0xb8;
        }),
        gate(VersionRange::at_least((22, 0, 0)), |o| {
            o.proc_pid = 0x60;
            o.smr = 0x3;
            o.io_dt_nvram = 0xc0;
            // task is allocated right behind proc
            o.proc_task = 0x0;
        }),
        // 16.4 betas still carried the task pointer in proc
        gate(VersionRange::exactly((22, 4, 0)), |o| {
            o.proc_task = 0x10;
        }),
        gate(VersionRange::at_least((22, 1, 0)), |o| {
            o.table_smr = true;
        }),
        gate(VersionRange::at_least((22, 3, 0)), |o| {
            o.smr = 0x2;
        }),
        gate(VersionRange::at_least((23, 0, 0)), |o| {
            o.ipc_port_kobject = 0x48;
            o.ipc_port_kobject_is_iomachport = true;
        }),
    ]
}

impl OffsetTable {
    /// Oldest supported layout (Darwin 21).
    fn baseline() -> Self {
        Self {
            proc_pid: 0x68,
            proc_task: 0x10,
            proc_list_next: 0x0,
            proc_struct_size: 0,
            all_proc: Address::NULL,

            itk_space: 0,
            task_itk_space_table: 0x20,
            table_smr: false,
            smr: 0x0,
            ipc_entry_object: 0x0,
            ipc_entry_size: 0x18,
            ipc_port_kobject: 0x58,
            ipc_port_kobject_is_iomachport: false,
            iomachport_object: 0x30,

            t1sz_boot: 0,

            io_dt_nvram: 0xc8,
            os_dict: 0x20,
            os_dict_size: 0x14,
            os_string: 0x10,
            os_metabase_size: 0xc,
            os_data: 0x18,
            io_aes_accel_special_keys: 0xd0,
            io_aes_accel_special_keys_size: 0xd8,
        }
    }

    /// Builds the table for `build`, resolving the dynamic fields through `pf`.
    ///
    /// Fails with `ErrorKind::Offset` if any dynamic field resolves to zero.
    pub fn new(build: &KernelBuild, pf: &mut impl Patchfinder) -> Result<Self> {
        let mut offsets = Self::baseline();

        for (range, apply) in overrides() {
            if range == build.version {
                trace!("applying offset overrides for {}", range);
                apply(&mut offsets);
            }
        }

        let t1sz_boot = resolve_dynamic(pf, "kernelConstant.T1SZ_BOOT")?;
        if t1sz_boot >= 64 {
            error!("T1SZ_BOOT out of range: {}", t1sz_boot);
            return Err(Error(ErrorOrigin::OsLayer, ErrorKind::Offset));
        }
        offsets.t1sz_boot = t1sz_boot as u32;

        offsets.itk_space = resolve_dynamic(pf, "kernelStruct.task.itk_space")? as usize;
        offsets.proc_struct_size = resolve_dynamic(pf, "kernelStruct.proc.struct_size")? as usize;
        offsets.all_proc = resolve_dynamic(pf, "kernelSymbol.allproc")?.into();

        debug!("{} offsets: {:#x?}", build, offsets);

        Ok(offsets)
    }

    /// Offset of the payload pointer for the given container value kind.
    pub fn os_value(&self, kind: OsValueKind) -> usize {
        match kind {
            OsValueKind::Data => self.os_data,
            OsValueKind::String => self.os_string,
        }
    }
}

fn resolve_dynamic(pf: &mut impl Patchfinder, name: &str) -> Result<u64> {
    match pf.resolve_named(name) {
        Ok(0) | Err(_) => {
            error!("unable to resolve {}", name);
            Err(Error(ErrorOrigin::OsLayer, ErrorKind::Offset))
        }
        Ok(value) => {
            trace!("{} = {:#x}", name, value);
            Ok(value)
        }
    }
}
