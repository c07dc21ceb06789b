use criterion::{criterion_group, criterion_main, Criterion};
use pole_link_core::scoring::score_and_rank;
use pole_link_core::similarity::{address_similarity, agent_name_similarity};
use pole_link_core::{
    AgentInfo, AssignmentId, AssignmentRecord, GeoPoint, Location, MatchCandidate, MatchReason,
    ReconciliationConfig,
};
use time::OffsetDateTime;

fn mk_candidate(index: usize) -> MatchCandidate {
    let offset = f64::from(u32::try_from(index % 100).unwrap_or(0)) * 0.000_01;
    let mut reasons = vec![MatchReason::GpsProximity];
    if index % 3 == 0 {
        reasons.push(MatchReason::AgentNameSimilar);
    }
    if index % 50 == 0 {
        reasons.insert(0, MatchReason::PropertyIdMatch);
    }
    MatchCandidate {
        assignment: AssignmentRecord {
            assignment_id: AssignmentId(format!("bench-{index:05}")),
            project_id: "bench".to_string(),
            pole_number: Some(format!("BEN.P.{index:05}")),
            property_id: None,
            one_map_nad_id: None,
            location: Location {
                address: format!("{index} Main Street"),
                point: Some(GeoPoint::new(-26.10 + offset, 28.05)),
            },
            agent: AgentInfo { name: "Bench Agent".to_string(), ..AgentInfo::default() },
            created_at: OffsetDateTime::UNIX_EPOCH,
        },
        reasons,
        distance_meters: Some(offset * 111_195.0),
        agent_name_similarity: Some(if index % 3 == 0 { 0.95 } else { 0.4 }),
        address_similarity: Some(0.5),
        linked_elsewhere: None,
        under_review_elsewhere: None,
    }
}

fn bench_scoring(c: &mut Criterion) {
    let candidates = (0..1_000).map(mk_candidate).collect::<Vec<_>>();
    let config = ReconciliationConfig::default();

    c.bench_function("score_and_rank_1000_candidates", |b| {
        b.iter(|| {
            let ranked = score_and_rank(candidates.clone(), &config);
            if ranked.is_empty() {
                panic!("scoring benchmark produced no candidates");
            }
        });
    });
}

fn bench_similarity(c: &mut Criterion) {
    c.bench_function("agent_and_address_similarity", |b| {
        b.iter(|| {
            let agent = agent_name_similarity("Thabo J. Mokoena", "Mokoena, Thabo");
            let address = address_similarity("12 Main Street, Lawley", "12 Main Rd Lawley Ext 1");
            if agent.is_none() || address.is_none() {
                panic!("similarity benchmark inputs should not normalise to empty");
            }
        });
    });
}

criterion_group!(matching_benches, bench_scoring, bench_similarity);
criterion_main!(matching_benches);
