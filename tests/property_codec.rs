//! Property-based tests for the Rice and ndim codecs
//!
//! Uses proptest to check that encoded samples decode to the input and that
//! region and axis shuffles are lossless.

use proptest::prelude::*;
use sums::codec::{adler32, ndim, rice, Adler32};

fn rice_bound(samples: usize, width: usize) -> usize {
    // Worst case is a raw block: every sample at full width plus block codes
    samples * width * 2 + 64
}

proptest! {
    #[test]
    fn prop_rice_i16_round_trip(
        input in prop::collection::vec(any::<i16>(), 0..600),
        blksz in 1usize..64,
    ) {
        let encoded = rice::encode(&input, blksz, rice_bound(input.len(), 2)).unwrap();
        let decoded: Vec<i16> = rice::decode(&encoded, input.len(), blksz).unwrap();
        prop_assert_eq!(decoded, input);
    }

    #[test]
    fn prop_rice_i32_smooth_data_compresses(
        start in -1_000_000i32..1_000_000,
        steps in prop::collection::vec(-3i32..=3, 64..512),
    ) {
        let mut value = start;
        let input: Vec<i32> = steps
            .iter()
            .map(|s| {
                value += s;
                value
            })
            .collect();
        let encoded = rice::encode(&input, 32, rice_bound(input.len(), 4)).unwrap();
        prop_assert!(encoded.len() < input.len() * 4);
        let decoded: Vec<i32> = rice::decode(&encoded, input.len(), 32).unwrap();
        prop_assert_eq!(decoded, input);
    }

    #[test]
    fn prop_rice_i8_round_trip(input in prop::collection::vec(any::<i8>(), 1..300)) {
        let encoded = rice::encode(&input, 32, rice_bound(input.len(), 1)).unwrap();
        let decoded: Vec<i8> = rice::decode(&encoded, input.len(), 32).unwrap();
        prop_assert_eq!(decoded, input);
    }

    #[test]
    fn prop_adler32_streaming_matches_one_shot(
        data in prop::collection::vec(any::<u8>(), 0..20_000),
        cut in 0usize..20_000,
    ) {
        let cut = cut.min(data.len());
        let mut running = Adler32::new();
        running.update(&data[..cut]);
        running.update(&data[cut..]);
        prop_assert_eq!(running.finish(), adler32(1, &data));
    }

    #[test]
    fn prop_pack_unpack_restores_region(
        dims in prop::collection::vec(1usize..6, 1..4),
        picks in prop::collection::vec((any::<prop::sample::Index>(), any::<prop::sample::Index>()), 4),
    ) {
        let count: usize = dims.iter().product();
        let array: Vec<u8> = (0..count).map(|i| (i % 251) as u8).collect();

        let mut start = Vec::new();
        let mut end = Vec::new();
        for (d, (a, b)) in dims.iter().zip(&picks) {
            let (a, b) = (a.index(*d), b.index(*d));
            start.push(a.min(b));
            end.push(a.max(b));
        }

        let mut packed = vec![0u8; ndim::region_count(&start, &end)];
        ndim::pack(1, &dims, &start, &end, &array, &mut packed).unwrap();

        let mut restored = vec![0u8; count];
        ndim::unpack(1, &dims, &start, &end, &packed, &mut restored).unwrap();

        // Elements inside the region come back, everything else stays zero
        let dope = ndim::dope(1, &dims);
        for (i, &value) in restored.iter().enumerate() {
            let inside = dims.iter().enumerate().all(|(axis, &d)| {
                let c = (i / dope[axis]) % d;
                c >= start[axis] && c <= end[axis]
            });
            if inside {
                prop_assert_eq!(value, array[i]);
            } else {
                prop_assert_eq!(value, 0);
            }
        }
    }

    #[test]
    fn prop_permute_inverse_is_identity(
        dims in prop::collection::vec(1usize..5, 2..4),
        seed in any::<u64>(),
    ) {
        let ndims = dims.len();
        let mut perm: Vec<usize> = (0..ndims).collect();
        perm.rotate_left((seed as usize) % ndims);
        let mut inverse = vec![0usize; ndims];
        for (i, &p) in perm.iter().enumerate() {
            inverse[p] = i;
        }

        let count: usize = dims.iter().product();
        let input: Vec<u8> = (0..count * 2).map(|i| (i % 256) as u8).collect();
        let mut shuffled = vec![0u8; input.len()];
        let permuted = ndim::permute(2, &dims, &perm, &input, &mut shuffled).unwrap();
        prop_assert_eq!(
            permuted.clone(),
            perm.iter().map(|&p| dims[p]).collect::<Vec<_>>()
        );

        let mut back = vec![0u8; input.len()];
        let restored = ndim::permute(2, &permuted, &inverse, &shuffled, &mut back).unwrap();
        prop_assert_eq!(restored, dims);
        prop_assert_eq!(back, input);
    }
}

#[test]
fn test_rice_empty_input() {
    let encoded = rice::encode::<i32>(&[], 32, 16).unwrap();
    assert!(encoded.is_empty());
    let decoded: Vec<i32> = rice::decode(&encoded, 0, 32).unwrap();
    assert!(decoded.is_empty());
}

#[test]
fn test_adler32_known_value() {
    assert_eq!(adler32(1, b"Wikipedia"), 0x11E6_0398);
}
