use test_case::test_case;

use crate::{Allocation, AllocationFlag, AllocationIndex, AllocationTable, Error, ShapeIndex};

fn table() -> AllocationTable {
    AllocationTable::new(vec![
        Allocation::parameter(0, 16, 0),
        Allocation::parameter_at(1, 8, 1, ShapeIndex::from([1])),
        Allocation::constant(2, 32),
        Allocation::temporary(3, 64),
        Allocation::output(4, 16),
        Allocation::thread_local(5, 4),
    ])
    .unwrap()
}

#[test]
fn test_table_lookups() {
    let table = table();
    assert_eq!(table.count(), 6);
    assert_eq!(table.size(AllocationIndex(3)), 64);
    assert!(table.contains(AllocationIndex(5)));
    assert!(!table.contains(AllocationIndex(6)));
    assert!(table.get(AllocationIndex(6)).is_none());
    assert_eq!(table[AllocationIndex(2)].size(), 32);
}

#[test]
fn test_parameter_count_uses_highest_parameter() {
    let table = table();
    assert_eq!(table.parameter_count(), 2);

    let found = table.find_parameter(1, &ShapeIndex::from([1])).unwrap();
    assert_eq!(found.index(), AllocationIndex(1));
    assert!(table.find_parameter(1, &ShapeIndex::root()).is_none());
}

#[test]
fn test_constant_bytes() {
    assert_eq!(table().constant_bytes(), 32);
    assert_eq!(AllocationTable::new(vec![]).unwrap().constant_bytes(), 0);
}

#[test_case(Allocation::parameter(0, 4, 0), AllocationFlag::EntryParameter ; "parameter")]
#[test_case(Allocation::constant(0, 4), AllocationFlag::Constant ; "constant")]
#[test_case(Allocation::temporary(0, 4), AllocationFlag::Temporary ; "temporary")]
#[test_case(Allocation::output(0, 4), AllocationFlag::MaybeLiveOut ; "output")]
#[test_case(Allocation::thread_local(0, 4), AllocationFlag::ThreadLocal ; "thread local")]
fn test_constructor_flags(allocation: Allocation, flag: AllocationFlag) {
    assert!(allocation.flags().contains(flag));
}

#[test]
fn test_live_out_parameter_keeps_slot() {
    let allocation = Allocation::parameter(0, 4, 3).live_out().with_color(2);
    assert!(allocation.is_entry_parameter());
    assert!(allocation.maybe_live_out());
    assert_eq!(allocation.color(), 2);
    assert_eq!(allocation.parameter_slot().unwrap().number, 3);
}

#[test]
fn test_misnumbered_allocation_rejected() {
    let result = AllocationTable::new(vec![Allocation::temporary(0, 4), Allocation::temporary(2, 4)]);
    assert!(matches!(result, Err(Error::InvalidProgram { .. })));
}
