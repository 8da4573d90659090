//! Hand-off record list and manager integration tests

mod common;

use common::*;
use nos_stage_loader::config::LoaderConfig;
use nos_stage_loader::error::LoaderError;
use nos_stage_loader::firmware::FirmwareVolume;
use nos_stage_loader::firmware::guids::{MEMORY_ALLOCATION_MODULE, MEMORY_ALLOCATION_STACK};
use nos_stage_loader::handoff::records::{INFO_RECORD_SIZE, RECORD_HEADER_SIZE};
use nos_stage_loader::handoff::{BootMode, HandoffManager, HandoffRecordList, RecordKind};
use nos_stage_loader::image::{ImageType, LoadedImage};
use nos_stage_loader::memory::PAGE_SIZE;
use proptest::prelude::*;
use uefi_raw::guid;
use uefi_raw::table::boot::MemoryType;

fn kinds(list: &HandoffRecordList<'_>) -> Vec<RecordKind> {
    list.records().map(|record| record.unwrap().kind()).collect()
}

fn padded(payload_len: usize) -> u64 {
    ((RECORD_HEADER_SIZE + payload_len + 7) & !7) as u64
}

#[cfg(test)]
mod record_list_tests {
    use super::*;

    #[test]
    fn test_fresh_list_layout() {
        let region = page_buffer(0x4000);
        let base = region.as_ptr() as u64;
        let list = HandoffRecordList::create(region, BootMode::FULL_CONFIGURATION).unwrap();

        let info = list.info().unwrap();
        assert_eq!(list.base(), base);
        assert_eq!(info.version, 9);
        assert_eq!(info.memory_bottom, base);
        assert_eq!(info.memory_top, base + 0x4000);
        assert_eq!(info.free_top, base + 0x4000);
        assert_eq!(info.end_of_list, base + INFO_RECORD_SIZE as u64);
        assert_eq!(info.free_bottom, info.end_of_list + RECORD_HEADER_SIZE as u64);
        assert_eq!(kinds(&list), vec![RecordKind::HANDOFF]);
    }

    #[test]
    fn test_region_too_small() {
        let region = page_buffer(32);
        assert_eq!(
            HandoffRecordList::create(region, BootMode::FULL_CONFIGURATION).err(),
            Some(LoaderError::InvalidParameter)
        );
        let region = page_buffer(0x100);
        assert_eq!(
            HandoffRecordList::create(&mut region[4..], BootMode::FULL_CONFIGURATION).err(),
            Some(LoaderError::InvalidParameter)
        );
    }

    #[test]
    fn test_typed_records_in_order() {
        let mut list =
            HandoffRecordList::create(page_buffer(0x1000), BootMode::FULL_CONFIGURATION).unwrap();
        let tag = guid!("9e0c30bc-3f06-4ba6-8288-09179b855dbe");

        list.add_cpu(48, 16).unwrap();
        list.add_firmware_volume(0xFF00_0000, 0x10_0000).unwrap();
        let handle = list.add_guid_data(tag, b"stage data").unwrap();
        assert_eq!(handle.length as u64, padded(16 + 10));

        assert_eq!(
            kinds(&list),
            vec![
                RecordKind::HANDOFF,
                RecordKind::CPU,
                RecordKind::FIRMWARE_VOLUME,
                RecordKind::GUID_EXTENSION,
            ]
        );

        let extension = list.records().nth(3).unwrap().unwrap();
        assert_eq!(extension.address, handle.address);
        assert_eq!(extension.name(), Some(tag));
        assert_eq!(&extension.payload[16..26], b"stage data");

        let volume = list.records().nth(2).unwrap().unwrap();
        assert_eq!(read_u64(volume.payload, 0), 0xFF00_0000);
        assert_eq!(read_u64(volume.payload, 8), 0x10_0000);
    }

    #[test]
    fn test_consumers_skip_unknown_kinds() {
        let mut list =
            HandoffRecordList::create(page_buffer(0x1000), BootMode::FULL_CONFIGURATION).unwrap();
        list.append_record(RecordKind(0x4242), &[1, 2, 3]).unwrap();
        list.append_record(RecordKind::UNUSED, &[0; 12]).unwrap();
        list.add_cpu(39, 16).unwrap();

        let records: Vec<_> = list.records().collect::<Result<_, _>>().unwrap();
        assert_eq!(records.len(), 4);
        assert_eq!(records[1].payload.len() as u64, padded(3) - RECORD_HEADER_SIZE as u64);

        let cpus: Vec<_> = records
            .iter()
            .filter(|record| record.kind() == RecordKind::CPU)
            .collect();
        assert_eq!(cpus.len(), 1);
        assert_eq!(cpus[0].payload[0], 39);
    }

    #[test]
    fn test_reserved_kinds_rejected() {
        let mut list =
            HandoffRecordList::create(page_buffer(0x1000), BootMode::FULL_CONFIGURATION).unwrap();
        let before = list.free_bottom().unwrap();
        for kind in [RecordKind::END_OF_LIST, RecordKind::HANDOFF] {
            assert_eq!(
                list.append_record(kind, &[0; 8]).err(),
                Some(LoaderError::InvalidParameter)
            );
        }
        assert_eq!(
            list.append_record(RecordKind::GUID_EXTENSION, &vec![0u8; 0x1_0000])
                .err(),
            Some(LoaderError::InvalidParameter)
        );
        assert_eq!(list.free_bottom().unwrap(), before);
    }

    #[test]
    fn test_batch_is_all_or_nothing() {
        let mut list =
            HandoffRecordList::create(page_buffer(0x100), BootMode::FULL_CONFIGURATION).unwrap();
        let free_bottom = list.free_bottom().unwrap();

        let large = [0u8; 0xC0];
        let batch: [(RecordKind, &[u8]); 2] =
            [(RecordKind::CPU, &[0; 8]), (RecordKind::GUID_EXTENSION, &large)];
        assert_eq!(list.append_all(&batch).err(), Some(LoaderError::OutOfSpace));
        assert_eq!(list.free_bottom().unwrap(), free_bottom);
        assert_eq!(kinds(&list), vec![RecordKind::HANDOFF]);

        let batch: [(RecordKind, &[u8]); 2] =
            [(RecordKind::CPU, &[0; 8]), (RecordKind::GUID_EXTENSION, &large[..0x20])];
        list.append_all(&batch).unwrap();
        assert_eq!(
            kinds(&list),
            vec![RecordKind::HANDOFF, RecordKind::CPU, RecordKind::GUID_EXTENSION]
        );
        assert_eq!(
            list.free_bottom().unwrap(),
            free_bottom + padded(8) + padded(0x20)
        );
    }

    #[test]
    fn test_reopen_existing_list() {
        let region = page_buffer(0x2000);
        {
            let mut list = HandoffRecordList::create(&mut *region, BootMode::RECOVERY).unwrap();
            list.add_cpu(48, 16).unwrap();
            list.allocate_pages(1, MemoryType::BOOT_SERVICES_DATA).unwrap();
        }

        let mut list = HandoffRecordList::open(&mut *region).unwrap();
        assert_eq!(list.boot_mode().unwrap(), BootMode::RECOVERY);
        assert_eq!(
            kinds(&list),
            vec![RecordKind::HANDOFF, RecordKind::CPU, RecordKind::MEMORY_ALLOCATION]
        );
        assert_eq!(list.free_top().unwrap(), list.base() + 0x1000);

        list.set_boot_mode(BootMode::FULL_CONFIGURATION).unwrap();
        list.add_firmware_volume(0x1000, 0x1000).unwrap();
        assert_eq!(list.records().count(), 4);
    }

    #[test]
    fn test_open_rejects_foreign_memory() {
        let region = page_buffer(0x1000);
        assert_eq!(
            HandoffRecordList::open(region).err(),
            Some(LoaderError::InvalidParameter)
        );
    }

    #[test]
    fn test_pages_carved_from_free_top() {
        let region = page_buffer(0x4000);
        let top = region.as_ptr() as u64 + 0x4000;
        let mut list = HandoffRecordList::create(region, BootMode::FULL_CONFIGURATION).unwrap();

        let pages = list.allocate_pages(2, MemoryType::BOOT_SERVICES_CODE).unwrap();
        let address = pages.as_ptr() as u64;
        assert_eq!(pages.len(), 2 * PAGE_SIZE);
        assert_eq!(address % PAGE_SIZE as u64, 0);
        assert_eq!(address, top - 0x2000);
        pages.fill(0x5A);

        assert_eq!(list.free_top().unwrap(), address);
        let allocation = list.records().nth(1).unwrap().unwrap();
        assert_eq!(allocation.kind(), RecordKind::MEMORY_ALLOCATION);
        assert_eq!(allocation.name(), Some(uefi_raw::Guid::ZERO));
        assert_eq!(read_u64(allocation.payload, 16), address);
        assert_eq!(read_u64(allocation.payload, 24), 0x2000);
        assert_eq!(
            read_u32(allocation.payload, 32),
            MemoryType::BOOT_SERVICES_CODE.0
        );

        assert_eq!(
            list.allocate_pages(2, MemoryType::BOOT_SERVICES_DATA).err(),
            Some(LoaderError::OutOfResources)
        );
        assert_eq!(
            list.allocate_pages(0, MemoryType::BOOT_SERVICES_DATA).err(),
            Some(LoaderError::InvalidParameter)
        );
    }
}

#[cfg(test)]
mod manager_tests {
    use super::*;

    fn loaded_image() -> LoadedImage {
        LoadedImage {
            address: 0x20_0000,
            size: 0x3000,
            entry_point: 0x20_0400,
            image_type: ImageType::BootServiceDriver,
            machine: 0x8664,
            pdb_path: None,
        }
    }

    #[test]
    fn test_prepare_records_stack_and_module() {
        let region = page_buffer(0x2000);
        let base = region.as_ptr() as u64;
        let config = LoaderConfig::default();

        let execution = {
            let records = HandoffRecordList::create(&mut *region, BootMode::FULL_CONFIGURATION)
                .unwrap();
            let mut manager = HandoffManager::new(records, allocator(40), config);
            manager
                .record_loaded_image(DXE_CORE_FILE, &loaded_image())
                .unwrap();
            manager.prepare(0x20_0400).unwrap()
        };

        assert_eq!(execution.entry_point(), 0x20_0400);
        assert_eq!(execution.record_list(), base);
        assert_eq!(execution.stack().size(), config.stack_size);
        assert_eq!(execution.stack_pointer() % 16, 0);
        assert!(execution.stack().contains(execution.stack_pointer()));

        let list = HandoffRecordList::open(&mut *region).unwrap();
        let records: Vec<_> = list.records().collect::<Result<_, _>>().unwrap();
        assert_eq!(records.len(), 3);

        let module = &records[1];
        assert_eq!(module.name(), Some(MEMORY_ALLOCATION_MODULE));
        assert_eq!(read_u64(module.payload, 16), 0x20_0000);
        assert_eq!(read_u64(module.payload, 24), 0x3000);
        assert_eq!(&module.payload[40..56], &DXE_CORE_FILE.to_bytes());
        assert_eq!(read_u64(module.payload, 56), 0x20_0400);

        let stack = &records[2];
        assert_eq!(stack.name(), Some(MEMORY_ALLOCATION_STACK));
        assert_eq!(read_u64(stack.payload, 16), execution.stack().base());
        assert_eq!(read_u64(stack.payload, 24), config.stack_size as u64);
    }

    #[test]
    fn test_prepare_without_stack_memory() {
        let records =
            HandoffRecordList::create(page_buffer(0x1000), BootMode::FULL_CONFIGURATION).unwrap();
        let manager = HandoffManager::new(records, allocator(2), LoaderConfig::default());
        assert_eq!(
            manager.prepare(0x20_0400).err(),
            Some(LoaderError::OutOfResources)
        );
    }

    #[test]
    fn test_prepare_rejects_null_entry() {
        let records =
            HandoffRecordList::create(page_buffer(0x1000), BootMode::FULL_CONFIGURATION).unwrap();
        let manager = HandoffManager::new(records, allocator(40), LoaderConfig::default());
        assert_eq!(
            manager.prepare(0).err(),
            Some(LoaderError::InvalidParameter)
        );
    }

    #[test]
    fn test_publish_volume() {
        let bytes = page_aligned(&volume(&[]));
        let volume = FirmwareVolume::parse(bytes).unwrap();

        let records =
            HandoffRecordList::create(page_buffer(0x1000), BootMode::FULL_CONFIGURATION).unwrap();
        let mut manager = HandoffManager::new(records, allocator(1), LoaderConfig::default());
        manager.publish_volume(&volume).unwrap();

        let record = manager.records().records().nth(1).unwrap().unwrap();
        assert_eq!(record.kind(), RecordKind::FIRMWARE_VOLUME);
        assert_eq!(read_u64(record.payload, 0), bytes.as_ptr() as u64);
        assert_eq!(read_u64(record.payload, 8), bytes.len() as u64);
    }
}

proptest! {
    #[test]
    fn prop_full_list_is_left_unchanged(
        sizes in prop::collection::vec(0usize..120, 1..24),
    ) {
        let mut list =
            HandoffRecordList::create(page_buffer(0x200), BootMode::FULL_CONFIGURATION).unwrap();

        for size in sizes {
            let before = list.free_bottom().unwrap();
            let free = list.free_space().unwrap() as u64;
            let payload = vec![0xA5u8; size];
            match list.append_record(RecordKind::GUID_EXTENSION, &payload) {
                Ok(handle) => {
                    prop_assert!(padded(size) <= free);
                    prop_assert_eq!(handle.address + RECORD_HEADER_SIZE as u64, before);
                    prop_assert_eq!(list.free_bottom().unwrap(), before + padded(size));
                }
                Err(error) => {
                    prop_assert_eq!(error, LoaderError::OutOfSpace);
                    prop_assert!(padded(size) > free);
                    prop_assert_eq!(list.free_bottom().unwrap(), before);
                }
            }
        }
        prop_assert!(list.records().all(|record| record.is_ok()));
    }
}
