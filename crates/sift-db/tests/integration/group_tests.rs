use chrono::{TimeDelta, Utc};
use sift_core::dedup::DuplicateDetector;
use sift_core::error::AppError;
use sift_core::models::{CanonicalRecord, DuplicateGroup, GroupStatus, StatusSignal};
use sift_core::scoring::DedupConfig;
use sift_core::traits::{GroupCreation, GroupMember, GroupStore, RecordStore};
use sift_db::{GroupRepository, RecordRepository};

use crate::integration::common::{draft, setup_test_db};

async fn seed(repo: &RecordRepository, source: &str, native: &str, code: &str) -> CanonicalRecord {
    repo.upsert(&draft(source, native, code, Utc::now() - TimeDelta::hours(1)))
        .await
        .unwrap()
        .record
}

fn created(creation: GroupCreation) -> DuplicateGroup {
    match creation {
        GroupCreation::Created(group) => group,
        other => panic!("expected a new group, got {other:?}"),
    }
}

#[tokio::test]
async fn create_group_marks_members_and_stats() {
    let (pool, _container) = setup_test_db().await;
    let records = RecordRepository::new(pool.clone());
    let groups = GroupRepository::new(pool);

    let a = seed(&records, "tutors_sg", "100", "D2388").await;
    let b = seed(&records, "home_tuition", "7", "D2388").await;

    let group = created(groups
        .create_group(
            a.id,
            &[
                GroupMember { record_id: a.id, score: 1.0 },
                GroupMember { record_id: b.id, score: 0.9 },
            ],
        )
        .await
        .unwrap());

    assert_eq!(group.status, GroupStatus::Active);
    assert_eq!(group.primary_record_id, a.id);
    assert_eq!(group.member_count, 2);
    assert!((group.avg_confidence - 0.95).abs() < 1e-4);

    let a = records.get(a.id).await.unwrap().unwrap();
    let b = records.get(b.id).await.unwrap().unwrap();
    assert_eq!(a.duplicate_group_id, Some(group.id));
    assert!(a.is_primary_in_group);
    assert_eq!(b.duplicate_group_id, Some(group.id));
    assert!(!b.is_primary_in_group);
    assert_eq!(b.duplicate_confidence_score, Some(0.9));
}

#[tokio::test]
async fn add_member_and_set_primary() {
    let (pool, _container) = setup_test_db().await;
    let records = RecordRepository::new(pool.clone());
    let groups = GroupRepository::new(pool);

    let a = seed(&records, "tutors_sg", "100", "D2388").await;
    let b = seed(&records, "home_tuition", "7", "D2388").await;
    let c = seed(&records, "sg_tutors", "55", "D2388").await;

    let group = created(groups
        .create_group(
            a.id,
            &[
                GroupMember { record_id: a.id, score: 1.0 },
                GroupMember { record_id: b.id, score: 0.8 },
            ],
        )
        .await
        .unwrap());

    let group = groups
        .add_member(group.id, GroupMember { record_id: c.id, score: 0.9 })
        .await
        .unwrap();
    assert_eq!(group.member_count, 3);
    assert!((group.avg_confidence - 0.9).abs() < 1e-4);

    let group = groups.set_primary(group.id, c.id).await.unwrap();
    assert_eq!(group.primary_record_id, c.id);

    let members = groups.list_members(group.id).await.unwrap();
    assert_eq!(members.len(), 3);
    let primaries: Vec<_> = members.iter().filter(|m| m.is_primary_in_group).collect();
    assert_eq!(primaries.len(), 1);
    assert_eq!(primaries[0].id, c.id);
}

#[tokio::test]
async fn missing_group_is_not_found() {
    let (pool, _container) = setup_test_db().await;
    let records = RecordRepository::new(pool.clone());
    let groups = GroupRepository::new(pool);
    let a = seed(&records, "tutors_sg", "100", "D2388").await;
    let missing = uuid::Uuid::new_v4();

    let err = groups
        .add_member(missing, GroupMember { record_id: a.id, score: 0.9 })
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));

    let err = groups
        .set_status(missing, GroupStatus::Resolved)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));

    assert!(groups.get_group(missing).await.unwrap().is_none());
}

#[tokio::test]
async fn detector_groups_cross_source_duplicates() {
    let (pool, _container) = setup_test_db().await;
    let records = RecordRepository::new(pool.clone());
    let groups = GroupRepository::new(pool);
    let detector = DuplicateDetector::new(records.clone(), groups.clone(), DedupConfig::default());

    let a = seed(&records, "tutors_sg", "100", "D2388").await;
    let outcome = detector.process(&a).await.unwrap();
    assert!(outcome.group_id.is_none());

    let b = seed(&records, "home_tuition", "7", "D2388").await;
    let outcome = detector.process(&b).await.unwrap();
    assert!(outcome.created_group);
    let group_id = outcome.group_id.unwrap();

    // A third source joins the existing group instead of starting another
    let c = seed(&records, "sg_tutors", "55", "D2388").await;
    let outcome = detector.process(&c).await.unwrap();
    assert_eq!(outcome.group_id, Some(group_id));
    assert!(!outcome.created_group);

    let group = groups.get_group(group_id).await.unwrap().unwrap();
    assert_eq!(group.member_count, 3);

    // An unrelated assignment from another source stays ungrouped
    let mut other = draft("sg_tutors", "56", "K7001", Utc::now());
    other.signals.subjects = ["Chemistry".to_string()].into();
    other.signals.levels = ["JC".to_string()].into();
    let other = records.upsert(&other).await.unwrap().record;
    assert!(detector.process(&other).await.unwrap().group_id.is_none());
}

#[tokio::test]
async fn closing_the_primary_reelects_then_resolves() {
    let (pool, _container) = setup_test_db().await;
    let records = RecordRepository::new(pool.clone());
    let groups = GroupRepository::new(pool);
    let detector = DuplicateDetector::new(records.clone(), groups.clone(), DedupConfig::default());

    let a = seed(&records, "tutors_sg", "100", "D2388").await;
    let b = seed(&records, "home_tuition", "7", "D2388").await;
    let group_id = detector.process(&b).await.unwrap().group_id.unwrap();
    let group = groups.get_group(group_id).await.unwrap().unwrap();
    let (primary, other) = if group.primary_record_id == a.id { (a, b) } else { (b, a) };

    let mut close = draft(&primary.source_id, "999", "D2388", Utc::now());
    close.record_key = primary.record_key.clone();
    close.status_signal = Some(StatusSignal::Close);
    let closed = records.upsert(&close).await.unwrap().record;

    let elected = detector.on_record_closed(&closed).await.unwrap();
    assert_eq!(elected, Some(other.id));
    let group = groups.get_group(group_id).await.unwrap().unwrap();
    assert_eq!(group.primary_record_id, other.id);

    let mut close = draft(&other.source_id, "998", "D2388", Utc::now());
    close.record_key = other.record_key.clone();
    close.status_signal = Some(StatusSignal::Close);
    let closed = records.upsert(&close).await.unwrap().record;

    assert_eq!(detector.on_record_closed(&closed).await.unwrap(), None);
    let group = groups.get_group(group_id).await.unwrap().unwrap();
    assert_eq!(group.status, GroupStatus::Resolved);
}

#[tokio::test]
async fn create_group_defers_to_existing_active_group() {
    let (pool, _container) = setup_test_db().await;
    let records = RecordRepository::new(pool.clone());
    let groups = GroupRepository::new(pool);

    let a = seed(&records, "tutors_sg", "100", "D2388").await;
    let b = seed(&records, "home_tuition", "7", "D2388").await;
    let c = seed(&records, "sg_tutors", "55", "D2388").await;

    let first = created(groups
        .create_group(
            a.id,
            &[
                GroupMember { record_id: b.id, score: 1.0 },
                GroupMember { record_id: a.id, score: 1.0 },
            ],
        )
        .await
        .unwrap());

    let second = groups
        .create_group(
            a.id,
            &[
                GroupMember { record_id: c.id, score: 1.0 },
                GroupMember { record_id: a.id, score: 1.0 },
            ],
        )
        .await
        .unwrap();
    assert_eq!(second, GroupCreation::AlreadyGrouped(first.id));

    // Nothing was written by the losing creation
    let c = records.get(c.id).await.unwrap().unwrap();
    assert!(c.duplicate_group_id.is_none());
    let group = groups.get_group(first.id).await.unwrap().unwrap();
    assert_eq!(group.member_count, 2);
    assert_eq!(groups.list_members(first.id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn stale_candidate_reads_end_in_one_group() {
    let (pool, _container) = setup_test_db().await;
    let records = RecordRepository::new(pool.clone());
    let groups = GroupRepository::new(pool);
    let detector = DuplicateDetector::new(records.clone(), groups.clone(), DedupConfig::default());

    let a = seed(&records, "tutors_sg", "100", "D2388").await;
    let b = seed(&records, "home_tuition", "7", "D2388").await;
    let c = seed(&records, "sg_tutors", "55", "D2388").await;

    let for_b = detector.find_candidates(&b).await.unwrap();
    let for_c = detector.find_candidates(&c).await.unwrap();

    let (first, second) = tokio::join!(
        detector.create_or_update_group(&b, &for_b),
        detector.create_or_update_group(&c, &for_c),
    );
    let (first, second) = (first.unwrap(), second.unwrap());

    assert_eq!(first.group_id, second.group_id);
    assert_eq!(u8::from(first.created_group) + u8::from(second.created_group), 1);

    let group_id = first.group_id.unwrap();
    let group = groups.get_group(group_id).await.unwrap().unwrap();
    let members = groups.list_members(group_id).await.unwrap();
    assert_eq!(group.member_count, 3);
    assert_eq!(members.len(), 3);
    assert!(members.iter().all(|m| m.duplicate_group_id == Some(group_id)));
    assert_eq!(members.iter().filter(|m| m.is_primary_in_group).count(), 1);
    let primary = members.iter().find(|m| m.is_primary_in_group).unwrap();
    assert_eq!(primary.id, group.primary_record_id);
    assert!([a.id, b.id, c.id].contains(&primary.id));
}
