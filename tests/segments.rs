use rand::{seq::SliceRandom, Rng};

use satproducts::segment::{SegmentAssembler, SegmentHeader, SegmentedImages};

fn tile(index: usize, len: usize) -> Vec<u8> {
    vec![index as u8 + 1; len]
}

#[test]
fn test_any_push_order_completes_on_last_distinct_segment() {
    let mut rng = rand::thread_rng();
    for num_segments in 1..=12 {
        let mut order: Vec<usize> = (0..num_segments).collect();
        order.shuffle(&mut rng);

        let mut img = SegmentAssembler::new(num_segments, 3, 2, 0);
        for (n, idx) in order.iter().enumerate() {
            assert!(!img.is_complete(), "complete after {n} of {num_segments}");
            assert!(img.push_segment(&tile(*idx, 6), *idx).unwrap());
        }
        assert!(img.is_complete(), "order {order:?}");

        let mosaic = img.mosaic();
        for idx in 0..num_segments {
            assert_eq!(mosaic[[idx * 2, 0]], idx as u8 + 1);
            assert_eq!(mosaic[[idx * 2 + 1, 2]], idx as u8 + 1);
        }
    }
}

#[test]
fn test_retransmissions_do_not_change_mosaic() {
    let mut rng = rand::thread_rng();
    let num_segments = 8;
    let mut img = SegmentAssembler::new(num_segments, 4, 1, 0);

    // every segment sent 3 times in random order, plus garbage indexes
    let mut pushes: Vec<usize> = (0..num_segments).flat_map(|i| [i, i, i]).collect();
    pushes.extend([num_segments, num_segments + 5, 1000]);
    pushes.shuffle(&mut rng);

    let mut accepted = 0;
    for idx in pushes {
        // payload of repeats differs from the first copy
        let payload: Vec<u8> = if img.progress().is_done(idx) {
            vec![rng.gen(); 4]
        } else {
            tile(idx, 4)
        };
        if img.push_segment(&payload, idx).unwrap() {
            accepted += 1;
        }
    }

    assert_eq!(accepted, num_segments);
    assert!(img.is_complete());
    for idx in 0..num_segments {
        assert_eq!(img.mosaic().row(idx).to_vec(), tile(idx, 4));
    }
}

#[test]
fn test_interleaved_images_on_one_stream() {
    let mut rng = rand::thread_rng();
    let mut pushes: Vec<(u16, usize)> = Vec::new();
    for image_id in 0..4u16 {
        pushes.extend((0..5).map(|idx| (image_id, idx)));
    }
    pushes.shuffle(&mut rng);

    let mut images = SegmentedImages::default();
    let mut finished = Vec::new();
    for (image_id, index) in pushes {
        let header = SegmentHeader {
            image_id,
            index,
            num_segments: 5,
            segment_width: 2,
            segment_height: 2,
        };
        let data = vec![image_id as u8; 4];
        if let Some(done) = images.push(&header, &data).unwrap() {
            finished.push(done);
        }
    }

    assert!(images.is_empty());
    assert_eq!(finished.len(), 4);
    for done in finished {
        assert!(done.mosaic().iter().all(|v| *v == done.image_id() as u8));
    }
}
