//! Regression gate and serving gate against a real experience store

use bao_server::error::ModelError;
use bao_server::model::Predictor;
use bao_server::{
    compute_regressions, Arm, BaoModel, BufferSnapshot, ExperienceStore, LoadOutcome, Plan, PlanRegressor,
    RegressionGate,
};
use serde_json::json;
use std::path::Path;
use tempfile::TempDir;

/// Scores plans by how far their arm marker is from a preferred arm
struct PreferArm(usize);

impl Predictor for PreferArm {
    fn fit(&mut self, _plans: &[Plan], _rewards: &[f64]) -> Result<(), ModelError> {
        Ok(())
    }

    fn predict(&self, plans: &[Plan]) -> Result<Vec<f64>, ModelError> {
        Ok(plans.iter()
            .map(|p| (p.root.plan_rows - self.0 as f64).abs())
            .collect())
    }

    fn save(&self, _path: &Path) -> Result<(), ModelError> {
        Ok(())
    }

    fn trained_on_count(&self) -> usize {
        0
    }
}

/// Plan whose row estimate marks the arm it was executed under
fn plan(arm: usize) -> Plan {
    serde_json::from_value(json!({
        "Plan": {
            "Node Type": "Hash Join", "Total Cost": 50.0 + arm as f64, "Plan Rows": arm as f64,
            "Plans": [
                {"Node Type": "Seq Scan", "Relation Name": "title", "Total Cost": 20.0, "Plan Rows": 100.0},
                {"Node Type": "Seq Scan", "Relation Name": "kind_type", "Total Cost": 1.0, "Plan Rows": 7.0}
            ]
        }
    })).unwrap()
}

/// Store holding one experimental query with the given per-arm rewards
async fn fixture(rewards: &[f64]) -> (TempDir, ExperienceStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = ExperienceStore::open(dir.path().join("bao.db")).await.unwrap();
    let query = store.record_experimental_query("SELECT count(*) FROM title").await.unwrap();

    for (arm, &reward) in rewards.iter().enumerate() {
        store.record_reward(&plan(arm), reward, 99).await.unwrap();
        let experience = store.last_reward_id_for_pid(99).await.unwrap().unwrap();
        store.record_experiment(query, experience, Arm::new(arm).unwrap()).await.unwrap();
    }

    (dir, store)
}

#[tokio::test]
async fn test_native_regression_from_store() {
    let (_dir, store) = fixture(&[10.0, 12.0, 9.0, 11.0, 20.0]).await;

    let groups = store.experiment_results().await.unwrap();
    let profile = compute_regressions(&groups, None).unwrap();
    assert_eq!(profile.regressed, 1);
    assert!((profile.total_excess - 1.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_gate_accepts_zero_regressions() {
    let (_dir, store) = fixture(&[10.0, 12.0, 9.0, 11.0, 20.0]).await;
    let gate = RegressionGate::new(store);

    let decision = gate.evaluate(None, &PreferArm(2)).await.unwrap();
    assert!(decision.accepted);
    assert_eq!(decision.new.regressed, 0);
    assert_eq!(decision.old.regressed, 1);
}

#[tokio::test]
async fn test_gate_rejects_worse_excess() {
    let (_dir, store) = fixture(&[10.0, 12.0, 9.0, 11.0, 20.0]).await;
    let gate = RegressionGate::new(store);

    // both regress once, but arm 4 overshoots by 11 against arm 0's 1
    assert!(!gate.should_replace_model(None, &PreferArm(4)).await.unwrap());
    assert!(gate.should_replace_model(Some(&PreferArm(4)), &PreferArm(1)).await.unwrap());
}

#[tokio::test]
async fn test_gate_is_deterministic() {
    let (_dir, store) = fixture(&[10.0, 12.0, 9.0, 11.0, 20.0]).await;
    let gate = RegressionGate::new(store);

    let first = gate.evaluate(Some(&PreferArm(3)), &PreferArm(1)).await.unwrap();
    let second = gate.evaluate(Some(&PreferArm(3)), &PreferArm(1)).await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_load_model_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = ExperienceStore::open(dir.path().join("bao.db")).await.unwrap();
    for arm in 0..5 {
        store.record_reward(&plan(arm), 5.0 + 3.0 * arm as f64, 7).await.unwrap();
        store.record_reward(&plan(arm), 6.0 + 2.0 * arm as f64, 8).await.unwrap();
    }

    let (plans, rewards): (Vec<Plan>, Vec<f64>) = store.experience().await.unwrap().into_iter().unzip();
    let mut fitted = PlanRegressor::new();
    fitted.fit(&plans, &rewards).unwrap();
    let path = dir.path().join("model");
    fitted.save(&path).unwrap();

    // no experiments recorded, so nothing can regress
    let serving = BaoModel::new(store);
    assert_eq!(serving.load_model(&path).await.unwrap(), LoadOutcome::Accepted);

    let buffers: BufferSnapshot = [("title".to_string(), 12)].into_iter().collect();
    for arm in 0..5 {
        let served = serving.predict(plan(arm), &buffers).await.unwrap();
        let direct = fitted.predict(&[plan(arm).with_buffers(&buffers)]).unwrap()[0];
        assert_eq!(served, direct);
    }

    let candidates: Vec<Plan> = (0..5).map(plan).collect();
    let selected = serving.select_plan(candidates.clone(), &buffers).await.unwrap() as usize;
    let direct: Vec<f64> = fitted.predict(
        &candidates.into_iter().map(|p| p.with_buffers(&buffers)).collect::<Vec<_>>()
    ).unwrap();
    assert_eq!(Some(selected), bao_server::model::argmin(&direct));
}

/// Plan whose root cost is the only feature that varies with the arm
fn costed_plan(arm: usize) -> Plan {
    serde_json::from_value(json!({
        "Plan": {
            "Node Type": "Hash Join", "Total Cost": 100.0 + 10.0 * arm as f64, "Plan Rows": 50.0,
            "Plans": [
                {"Node Type": "Seq Scan", "Relation Name": "title", "Total Cost": 20.0, "Plan Rows": 100.0},
                {"Node Type": "Seq Scan", "Relation Name": "kind_type", "Total Cost": 1.0, "Plan Rows": 7.0}
            ]
        }
    })).unwrap()
}

/// Rewards fall as root cost rises, so the most expensive looking arm is the
/// fastest and the native arm regresses
const FALLING: [f64; 5] = [20.0, 17.0, 14.0, 11.0, 8.0];

async fn costed_fixture() -> (TempDir, ExperienceStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = ExperienceStore::open(dir.path().join("bao.db")).await.unwrap();
    let query = store.record_experimental_query("SELECT count(*) FROM title t, kind_type k").await.unwrap();

    for (arm, &reward) in FALLING.iter().enumerate() {
        store.record_reward(&costed_plan(arm), reward, 31).await.unwrap();
        let experience = store.last_reward_id_for_pid(31).await.unwrap().unwrap();
        store.record_experiment(query, experience, Arm::new(arm).unwrap()).await.unwrap();
    }

    (dir, store)
}

/// Fit on the fixture plans with the given rewards and save under `name`
fn save_model(dir: &TempDir, name: &str, rewards: &[f64]) -> (PlanRegressor, std::path::PathBuf) {
    let plans: Vec<Plan> = (0..rewards.len()).map(costed_plan).collect();
    let mut model = PlanRegressor::new();
    model.fit(&plans, rewards).unwrap();
    let path = dir.path().join(name);
    model.save(&path).unwrap();
    (model, path)
}

#[tokio::test]
async fn test_regressing_model_is_not_served() {
    let (dir, store) = costed_fixture().await;
    let (_, good_path) = save_model(&dir, "good", &FALLING);
    let inverted: Vec<f64> = FALLING.iter().rev().copied().collect();
    let (_, bad_path) = save_model(&dir, "bad", &inverted);

    let serving = BaoModel::new(store);
    let buffers = BufferSnapshot::new();
    let candidates: Vec<Plan> = (0..5).map(costed_plan).collect();

    assert_eq!(serving.load_model(&good_path).await.unwrap(), LoadOutcome::Accepted);
    assert_eq!(serving.select_plan(candidates.clone(), &buffers).await.unwrap(), 4);
    let before = serving.predict(costed_plan(2), &buffers).await.unwrap();

    // picks arm 0 everywhere: one regression against a served model with none
    assert_eq!(serving.load_model(&bad_path).await.unwrap(), LoadOutcome::Rejected);
    assert!(serving.is_loaded().await);
    assert_eq!(serving.select_plan(candidates, &buffers).await.unwrap(), 4);
    assert_eq!(serving.predict(costed_plan(2), &buffers).await.unwrap(), before);

    // offering the served model again never regresses against itself
    assert_eq!(serving.load_model(&good_path).await.unwrap(), LoadOutcome::Accepted);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_selection_during_swap() {
    let (dir, store) = costed_fixture().await;
    let (good, good_path) = save_model(&dir, "good", &FALLING);
    let candidates: Vec<Plan> = (0..5).map(costed_plan).collect();
    let buffers = BufferSnapshot::new();

    let expected = bao_server::model::argmin(&good.predict(&candidates).unwrap()).unwrap() as u32;
    assert_ne!(expected, 0);
    let expected_prediction = good.predict(&[costed_plan(1)]).unwrap()[0];

    let serving = std::sync::Arc::new(BaoModel::new(store));
    let mut readers = Vec::new();
    for _ in 0..4 {
        let serving = serving.clone();
        let candidates = candidates.clone();
        let buffers = buffers.clone();
        readers.push(tokio::spawn(async move {
            let mut seen = Vec::new();
            for _ in 0..200 {
                let selected = serving.select_plan(candidates.clone(), &buffers).await.unwrap();
                let predicted = serving.predict(costed_plan(1), &buffers).await.unwrap();
                seen.push((selected, predicted));
                tokio::task::yield_now().await;
            }
            seen
        }));
    }

    assert_eq!(serving.load_model(&good_path).await.unwrap(), LoadOutcome::Accepted);

    for reader in readers {
        for (selected, predicted) in reader.await.unwrap() {
            if selected == 0 {
                assert!(predicted.is_nan() || predicted == expected_prediction);
            } else {
                assert_eq!(selected, expected);
                assert_eq!(predicted, expected_prediction);
            }
        }
    }

    assert_eq!(serving.select_plan(candidates, &buffers).await.unwrap(), expected);
}
