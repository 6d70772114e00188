//! Tests for scoped symbol maps.

use crate::ir::SymbolId;
use crate::scope::SymbolMap;

#[test]
fn set_returns_previous_value() {
    let mut map: SymbolMap<i32> = SymbolMap::new();
    let a = SymbolId(3);
    assert_eq!(map.set(a, Some(1)), None);
    assert_eq!(map.get(a), Some(&1));
    assert_eq!(map.set(a, Some(2)), Some(1));
    assert_eq!(map.set(a, None), Some(2));
    assert!(!map.contains(a));
}

#[test]
fn save_and_restore_idiom() {
    let mut map: SymbolMap<&str> = SymbolMap::new();
    let a = SymbolId(0);
    map.insert(a, "outer");
    let old = map.set(a, Some("inner"));
    assert_eq!(map.get(a), Some(&"inner"));
    map.set(a, old);
    assert_eq!(map.get(a), Some(&"outer"));
}

#[test]
fn iterates_defined_entries_only() {
    let mut map: SymbolMap<i32> = SymbolMap::new();
    map.insert(SymbolId(1), 10);
    map.insert(SymbolId(4), 40);
    let entries: Vec<(SymbolId, i32)> = map.iter().map(|(s, v)| (s, *v)).collect();
    assert_eq!(entries, vec![(SymbolId(1), 10), (SymbolId(4), 40)]);
    assert_eq!(map.keys(), vec![SymbolId(1), SymbolId(4)]);
}

#[test]
fn grows_on_demand() {
    let mut map: SymbolMap<i32> = SymbolMap::new();
    assert_eq!(map.get(SymbolId(100)), None);
    map.insert(SymbolId(100), 1);
    assert_eq!(map.get(SymbolId(100)), Some(&1));
    assert_eq!(map.get(SymbolId(99)), None);
}
