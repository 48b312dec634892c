use proptest::prelude::*;
use shunt_fwmark::{
    Fwmark, ALL_SOURCES_MASK, LEGACY_SNAT, QOS_CATEGORY_MASK, ROUTING_MASK, VPN_MASK,
};

const FIELD_MASKS: &[Fwmark] = &[
    ALL_SOURCES_MASK,
    ROUTING_MASK,
    LEGACY_SNAT,
    VPN_MASK,
    QOS_CATEGORY_MASK,
];

proptest! {
    #[test]
    fn double_complement_is_identity(value in any::<u32>()) {
        let mark = Fwmark::new(value);
        prop_assert_eq!(mark, !!mark);
    }

    #[test]
    fn and_yields_intersection_only(a in any::<u32>(), b in any::<u32>()) {
        let (a, b) = (Fwmark::new(a), Fwmark::new(b));
        prop_assert_eq!(a & b, b & a);
        prop_assert_eq!(Fwmark::default(), (a & b) & !(a & Fwmark::new(u32::MAX)));
        prop_assert_eq!((a & b).value(), a.value() & b.value());
    }

    #[test]
    fn field_masked_values_never_leak(
        value in any::<u32>(),
        i in 0..5usize,
        j in 0..5usize,
    ) {
        // A value restricted to one field, OR'd with a value restricted to
        // another, stays inside the union of the two fields.
        let a = Fwmark::new(value) & FIELD_MASKS[i];
        let b = Fwmark::new(value.rotate_left(7)) & FIELD_MASKS[j];
        let union = FIELD_MASKS[i] | FIELD_MASKS[j];
        prop_assert_eq!(Fwmark::default(), (a | b) & !union);
    }
}
