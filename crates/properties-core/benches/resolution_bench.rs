use criterion::{criterion_group, criterion_main, Criterion};
use properties_core::{
    drop_bundles, merge_bundles, project_settings, Bundle, BundleId, BundleValue,
};
use time::{Duration, OffsetDateTime};

fn mk_bundle(index: i64) -> Bundle {
    // Every third bundle is a child of the one before it.
    let parent_id = if index % 3 == 0 { BundleId(index - 1) } else { BundleId::NONE };
    Bundle {
        id: BundleId(index),
        parent_id,
        name: format!("bench-bundle-{index}"),
        tag: Some(format!("tier-{}", index % 5)),
    }
}

fn mk_value(index: i64) -> BundleValue {
    let created_at = OffsetDateTime::UNIX_EPOCH + Duration::days(index % 30);
    BundleValue {
        bundle_id: BundleId(index % 400 + 1),
        name: format!("setting-{}", index % 50),
        value: format!("value-{index}"),
        created_at,
        expired_at: if index % 4 == 0 { Some(created_at + Duration::days(7)) } else { None },
    }
}

fn bench_resolution(c: &mut Criterion) {
    let current = (1..=400).map(mk_bundle).collect::<Vec<_>>();
    let incoming = (350..=450).map(mk_bundle).collect::<Vec<_>>();
    let values = (0..5_000).map(mk_value).collect::<Vec<_>>();
    let active = (1..=400).step_by(2).map(BundleId).collect::<Vec<_>>();
    let at = OffsetDateTime::UNIX_EPOCH + Duration::days(20);

    c.bench_function("merge_bundles_400_current_100_incoming", |b| {
        b.iter(|| {
            let merged = merge_bundles(&current, &incoming);
            assert!(!merged.is_empty());
        });
    });

    c.bench_function("drop_bundles_400_current_100_removed", |b| {
        b.iter(|| {
            let dropped = drop_bundles(&current, &incoming);
            assert_eq!(dropped.len(), current.len());
        });
    });

    c.bench_function("project_settings_5000_values", |b| {
        b.iter(|| {
            let settings = project_settings(&active, &values, at);
            assert!(!settings.is_empty());
        });
    });
}

criterion_group!(benches, bench_resolution);
criterion_main!(benches);
