use crate as cs;

#[test]
fn basic_test() {
    let mut inst = cs::Instance::new();
    let entity = inst.add_entity();

    let comp = inst.add_component();
    comp.set(&entity, "Hola Cirrus");
    let data_ref = comp.get(&entity).unwrap();
    assert_eq!(*data_ref, "Hola Cirrus");
}

#[test]
fn value_dropped_with_entity() {
    let mut inst = cs::Instance::new();
    let comp = inst.add_component::<String>();

    let id = {
        let e = inst.add_entity();
        comp.set(&e, "transient".to_string());
        assert_eq!(comp.len(), 1);
        e.get_raw_id()
    };

    // The entity went out of scope, so the value must be gone and the
    // id must be recycled for the next allocation.
    assert_eq!(comp.len(), 0);
    let e2 = inst.add_entity();
    assert_eq!(e2.get_raw_id(), id);
    assert!(comp.get(&e2).is_none());
}

#[test]
fn clone_keeps_entity_alive() {
    let mut inst = cs::Instance::new();
    let comp = inst.add_component();

    let e = inst.add_entity();
    comp.set(&e, 42);
    let e_clone = e.clone();
    drop(e);

    assert_eq!(*comp.get(&e_clone).unwrap(), 42);
    assert_eq!(inst.num_entities(), 1);
}

#[test]
fn take_removes_value() {
    let mut inst = cs::Instance::new();
    let comp = inst.add_component();
    let e = inst.add_entity();

    comp.set(&e, 7u32);
    assert_eq!(comp.take(&e), Some(7));
    assert_eq!(comp.take(&e), None);
    assert!(!comp.has(&e));
}

#[test]
fn for_each_visits_in_id_order() {
    let mut inst = cs::Instance::new();
    let comp = inst.add_component();

    let entities: Vec<_> = (0..4).map(|_| inst.add_entity()).collect();
    for (i, e) in entities.iter().enumerate() {
        comp.set(e, i as u32 * 10);
    }
    comp.take(&entities[2]);

    let mut seen = Vec::new();
    comp.for_each(|id, val| seen.push((id, *val)));
    assert_eq!(seen, vec![(0, 0), (1, 10), (3, 30)]);
}

#[test]
fn get_mut_updates_value() {
    let mut inst = cs::Instance::new();
    let comp = inst.add_component();
    let e = inst.add_entity();

    comp.set(&e, 1.0f32);
    *comp.get_mut(&e).unwrap() += 1.0;
    assert_eq!(*comp.get(&e).unwrap(), 2.0);
}
