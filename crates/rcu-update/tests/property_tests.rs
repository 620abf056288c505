//! Property-based tests for the chunk reader, session streams and timers

use std::io::Cursor;
use std::time::{Duration, Instant};

use proptest::prelude::*;
use rcu_update::stream::SessionStream;
use rcu_update::{CHUNK_SIZE, ChunkReader, ControllerKey, TimeoutSupervisor, UpdateError};

fn image(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i.wrapping_mul(31) % 256) as u8).collect()
}

fn stream(size: usize, increment: u8) -> Result<SessionStream<Cursor<Vec<u8>>>, UpdateError> {
    SessionStream::with_source(
        ControllerKey::new(3, 1),
        11,
        0,
        increment,
        Cursor::new(image(size)),
        size as u64,
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// After a reload around any offset, reads up to one chunk long are served
    /// with the image's bytes
    #[test]
    fn prop_reload_serves_requested_range(
        size in 1usize..20_000,
        offset_seed in any::<u32>(),
        len in 1usize..CHUNK_SIZE,
    ) {
        let offset = (offset_seed as usize) % size;
        let len = len.min(size - offset);
        let data = image(size);

        let mut reader = ChunkReader::new();
        reader.stage(Cursor::new(data.clone()), size as u64)?;
        let aligned = reader.reload(offset as u64)?;
        prop_assert_eq!(aligned % CHUNK_SIZE as u64, 0);
        prop_assert!(aligned <= offset as u64);

        let mut buf = vec![0u8; len];
        prop_assert_eq!(reader.copy_to(offset as u64, &mut buf)?, Some(len));
        prop_assert_eq!(Some(buf.as_slice()), data.get(offset..offset + len));
    }

    /// Any range that passes the end of the image is rejected
    #[test]
    fn prop_out_of_range_rejected(size in 1usize..10_000, past in 1usize..4096) {
        let mut reader = ChunkReader::new();
        reader.stage(Cursor::new(image(size)), size as u64)?;
        let mut buf = vec![0u8; past];
        let offset = size.saturating_sub(past) + 1;
        let result = reader.copy_to(offset as u64, &mut buf);
        prop_assert!(
            matches!(result, Err(UpdateError::OffsetOutOfRange { .. })),
            "offset {} length {} size {} was accepted",
            offset,
            past,
            size
        );
    }

    /// A sequential download with arbitrary read sizes delivers every byte and
    /// reports strictly increasing progress ending in a single 100
    #[test]
    fn prop_sequential_download(
        size in 1usize..16_000,
        read_sizes in proptest::collection::vec(1usize..300, 1..16),
        increment in 1u8..=100,
    ) {
        let data = image(size);
        let mut stream = stream(size, increment)?;
        let mut received = Vec::with_capacity(size);
        let mut percents = Vec::new();
        let mut completions = 0usize;
        let mut step = 0usize;

        while received.len() < size {
            let want = read_sizes
                .get(step % read_sizes.len())
                .copied()
                .unwrap_or(1)
                .min(size - received.len());
            step += 1;

            let mut buf = vec![0u8; want];
            let outcome = stream.read(received.len() as u64, &mut buf)?;
            if let Some(offset) = outcome.reload {
                stream.reload(offset)?;
            }
            if outcome.refill {
                stream.refill_next()?;
            }
            if let Some(percent) = outcome.percent {
                percents.push(percent);
            }
            if outcome.complete {
                completions += 1;
            }
            if outcome.copied > 0 {
                received.extend_from_slice(&buf);
            }
        }

        prop_assert_eq!(received, data);
        prop_assert_eq!(completions, 1);
        prop_assert_eq!(percents.last().copied(), Some(100));
        prop_assert!(percents.windows(2).all(|w| matches!(w, [a, b] if a < b)));
        prop_assert_eq!(percents.iter().filter(|p| **p == 100).count(), 1);
    }

    /// Re-reading bytes already delivered never moves progress backwards or
    /// reports completion twice
    #[test]
    fn prop_rereads_do_not_regress(size in 2048usize..12_000, back in 1usize..2048) {
        let mut stream = stream(size, 10)?;
        let mut buf = vec![0u8; 512];
        let mut offset = 0usize;
        while offset + 512 <= size.min(3000) {
            let outcome = stream.read(offset as u64, &mut buf)?;
            if outcome.refill {
                stream.refill_next()?;
            }
            offset += 512;
        }

        let high = stream.bytes_read_controller();
        let start = offset.saturating_sub(back);
        let mut small = [0u8; 1];
        let outcome = stream.read(start as u64, &mut small)?;
        if let Some(reload) = outcome.reload {
            stream.reload(reload)?;
        }
        prop_assert_eq!(stream.bytes_read_controller(), high);
        prop_assert!(!outcome.complete);
    }

    /// Expired timers come out in deadline order and only once
    #[test]
    fn prop_timers_expire_in_order(delays in proptest::collection::vec(0u64..1000, 1..32)) {
        let now = Instant::now();
        let mut timers = TimeoutSupervisor::new();
        for (i, delay) in delays.iter().enumerate() {
            let controller = u8::try_from(i).unwrap_or(u8::MAX);
            timers.create(ControllerKey::new(0, controller), Duration::from_millis(*delay), now);
        }

        let expired = timers.take_expired(now + Duration::from_secs(1));
        prop_assert_eq!(expired.len(), delays.len());
        let ordered: Vec<u64> = expired
            .iter()
            .filter_map(|key| delays.get(usize::from(key.controller_id)).copied())
            .collect();
        prop_assert!(ordered.windows(2).all(|w| matches!(w, [a, b] if a <= b)));
        prop_assert!(timers.is_empty());
        prop_assert!(timers.take_expired(now + Duration::from_secs(2)).is_empty());
    }
}
