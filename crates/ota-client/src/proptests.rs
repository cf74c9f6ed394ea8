//! Property-based tests for ota-client.
//!
//! These tests use proptest to verify correctness properties across
//! randomly generated inputs.
//!
//! # Properties Tested
//!
//! - Deferred commit: however a download is split, the region stays
//!   uncommitted until finalize and is byte-exact afterwards
//! - Hashing: deterministic, and sensitive to every single byte
//! - Version ordering: reflexive, antisymmetric against releases, and a
//!   pre-release candidate is never newer
//! - Range accounting: every byte is requested exactly once
//! - Header scanning: arbitrary input never panics

#![cfg(test)]

use proptest::prelude::*;

use crate::artifact::{hash_region, sha384, verify, ImageVerifier};
use crate::download::{Downloader, MemorySink, CHUNK_SIZE};
use crate::flash::{FlashRegion, MemFlash, SECTOR_SIZE, SENTINEL_UNCOMMITTED};
use crate::http::ResponseHead;
use crate::publisher::PublisherKey;
use crate::redirect::Endpoint;
use crate::testing::{fast_network, MockServer};
use crate::version::{compare, VersionOrdering};
use crate::writer::DeferredCommitWriter;

// =============================================================================
// Generators
// =============================================================================

/// Image content spanning up to three sectors.
fn arb_image() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 1..(3 * SECTOR_SIZE as usize))
}

/// An image plus sorted split points inside it.
fn arb_split_image() -> impl Strategy<Value = (Vec<u8>, Vec<usize>)> {
    arb_image().prop_flat_map(|image| {
        let len = image.len();
        (
            Just(image),
            prop::collection::vec(0..len, 0..8).prop_map(|mut cuts| {
                cuts.sort_unstable();
                cuts.dedup();
                cuts
            }),
        )
    })
}

/// Version strings, with and without a pre-release suffix.
fn arb_version() -> impl Strategy<Value = String> {
    (0u32..20, 0u32..20, 0u32..20, prop::option::of(0u32..5)).prop_map(
        |(major, minor, patch, pre)| match pre {
            Some(n) => format!("{major}.{minor}.{patch}-rc{n}"),
            None => format!("{major}.{minor}.{patch}"),
        },
    )
}

/// Version strings without a pre-release suffix.
fn arb_release() -> impl Strategy<Value = String> {
    (0u32..20, 0u32..20, 0u32..20)
        .prop_map(|(major, minor, patch)| format!("{major}.{minor}.{patch}"))
}

fn region() -> FlashRegion {
    FlashRegion::new(1, 4 * SECTOR_SIZE)
}

fn stream(image: &[u8], cuts: &[usize]) -> (MemFlash, DeferredCommitWriter<MemFlash>) {
    let flash = MemFlash::new(6 * SECTOR_SIZE);
    let mut writer = DeferredCommitWriter::new(flash.clone());
    let mut start = 0;
    for &cut in cuts.iter().chain(std::iter::once(&image.len())) {
        if cut > start {
            writer
                .write(region(), start as u32, &image[start..cut])
                .unwrap();
            start = cut;
        }
    }
    (flash, writer)
}

// =============================================================================
// Deferred commit
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// For any image and any way of splitting its download, the first byte
    /// is not on flash until finalize, everything else is, and each sector
    /// is erased exactly once.
    #[test]
    fn prop_deferred_commit_is_atomic((image, cuts) in arb_split_image()) {
        let (flash, mut writer) = stream(&image, &cuts);
        let start = region().start_address();

        prop_assert_eq!(flash.byte_at(start), SENTINEL_UNCOMMITTED);
        prop_assert_eq!(writer.pending_first_byte(region()), Some(image[0]));
        prop_assert_eq!(flash.snapshot(start + 1, image.len() - 1), image[1..].to_vec());

        let sectors = (image.len() as u32).div_ceil(SECTOR_SIZE);
        let expected: Vec<u32> = (0..sectors).map(|i| start + i * SECTOR_SIZE).collect();
        prop_assert_eq!(flash.erase_log(), expected);

        writer.finalize(region()).unwrap();
        prop_assert_eq!(flash.snapshot(start, image.len()), image);
    }

    /// Hashing a region with its first byte deferred gives the digest of
    /// the image itself.
    #[test]
    fn prop_deferred_hash_matches_image((image, cuts) in arb_split_image()) {
        let (flash, writer) = stream(&image, &cuts);
        let digest = hash_region(
            &flash,
            region(),
            image.len() as u32,
            writer.pending_first_byte(region()),
        )
        .unwrap();
        prop_assert_eq!(digest, sha384(&image));
    }
}

// =============================================================================
// Hashing and signatures
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Flipping any bits of any single byte changes the digest.
    #[test]
    fn prop_hash_single_byte_sensitivity(
        image in arb_image(),
        index in any::<prop::sample::Index>(),
        mask in 1u8..=255,
    ) {
        let mut corrupted = image.clone();
        let at = index.index(image.len());
        corrupted[at] ^= mask;

        prop_assert_eq!(sha384(&image), sha384(&image));
        prop_assert_ne!(sha384(&image), sha384(&corrupted));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// A signed image verifies; the same signature over a corrupted image
    /// does not.
    #[test]
    fn prop_signature_binds_image(
        image in arb_image(),
        index in any::<prop::sample::Index>(),
    ) {
        let publisher = PublisherKey::from_scalar(&[0x29; 48]).unwrap();
        let signature = publisher.sign_image(&image).unwrap();
        let verifier = ImageVerifier::new(publisher.public_key());

        let (flash, writer) = stream(&image, &[]);
        let first = writer.pending_first_byte(region());
        prop_assert!(verifier.verify_region(&flash, region(), &signature, first).is_ok());

        let mut corrupted = image.clone();
        let at = index.index(image.len());
        corrupted[at] ^= 0x01;
        let result = verify(&sha384(&corrupted), &signature, &publisher.public_key());
        prop_assert!(result.is_err());
    }
}

// =============================================================================
// Version ordering
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Every version is the same as itself.
    #[test]
    fn prop_version_reflexive(version in arb_version()) {
        prop_assert_eq!(compare(&version, &version), VersionOrdering::Same);
    }

    /// Swapping the arguments swaps Newer and Older whenever one side is a
    /// release.
    #[test]
    fn prop_version_antisymmetric(a in arb_release(), b in arb_version()) {
        let forward = compare(&a, &b);
        let backward = compare(&b, &a);
        let expected = match forward {
            VersionOrdering::Newer => VersionOrdering::Older,
            VersionOrdering::Older => VersionOrdering::Newer,
            VersionOrdering::Same => VersionOrdering::Same,
        };
        prop_assert_eq!(backward, expected);
    }

    /// A pre-release candidate is never newer than anything it differs from.
    #[test]
    fn prop_prerelease_candidate_is_older(pre in arb_version(), other in arb_version()) {
        let pre = if pre.contains('-') { pre } else { format!("{pre}-beta") };
        prop_assume!(pre != other);
        prop_assert_eq!(compare(&pre, &other), VersionOrdering::Older);
    }

    /// Releases never rank below pre-releases.
    #[test]
    fn prop_release_beats_prerelease(
        release in arb_release(),
        pre in arb_version(),
    ) {
        let pre = if pre.contains('-') { pre } else { format!("{pre}-beta") };
        prop_assert_eq!(compare(&release, &pre), VersionOrdering::Newer);
        prop_assert_eq!(compare(&pre, &release), VersionOrdering::Older);
    }
}

// =============================================================================
// Range accounting and header scanning
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Every byte of the asset is requested exactly once, in order, in
    /// ranges of at most one chunk.
    #[test]
    fn prop_range_accounting(size in 1usize..20_000) {
        let content: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let (received, requests) = runtime.block_on(async {
            let mut server = MockServer::new();
            server.serve("cdn.local", "asset", content.clone());
            let endpoint = Endpoint {
                host: "cdn.local".to_string(),
                path: "asset".to_string(),
                port: 80,
                use_tls: false,
            };

            let network = fast_network();
            let mut buf = vec![0u8; size];
            let mut sink = MemorySink::new(&mut buf);
            let n = Downloader::new(&mut server, &network)
                .download(&endpoint, &mut sink, size as u32)
                .await
                .unwrap();
            prop_assert_eq!(sink.filled(), &content[..]);
            Ok((n, server.requests()))
        })?;

        prop_assert_eq!(received as usize, size);
        let chunks = size.div_ceil(CHUNK_SIZE as usize);
        prop_assert_eq!(requests.len(), chunks);
        for (i, request) in requests.iter().enumerate() {
            let start = i as u32 * CHUNK_SIZE;
            prop_assert_eq!(request.range, Some((start, start + CHUNK_SIZE - 1)));
        }
    }

    /// The header scanner accepts or rejects arbitrary input without
    /// panicking.
    #[test]
    fn prop_scanner_never_panics(raw in prop::collection::vec(any::<u8>(), 0..512)) {
        if let Ok(head) = ResponseHead::parse(&raw) {
            let _ = head.content_length();
            let _ = head.content_range();
            let _ = head.location();
        }
    }

    /// Header lookups do not depend on header order or case.
    #[test]
    fn prop_scanner_order_independent(
        length in 0u32..100_000,
        start in 0u32..1_000,
        swap in any::<bool>(),
    ) {
        let range = format!("content-RANGE: bytes {start}-{}/{}", start + 9, start + 10);
        let len = format!("Content-Length: {length}");
        let (first, second) = if swap { (&range, &len) } else { (&len, &range) };
        let raw = format!("HTTP/1.1 206 Partial Content\r\n{first}\r\n{second}\r\n\r\n");

        let head = ResponseHead::parse(raw.as_bytes()).unwrap();
        prop_assert_eq!(head.content_length(), Some(length));
        prop_assert_eq!(head.content_range().map(|r| r.start), Some(start));
    }
}
