use std::time::Duration;

use spindle::{ThrottleConfig, ThrottlingController};

#[test]
fn test_no_throttling_at_rest() {
    let controller = ThrottlingController::with_defaults();
    assert_eq!(controller.throttling(), 0.0);
    for _ in 0..100 {
        assert!(
            !controller.is_request_throttled(),
            "A zero drop probability must never shed a request"
        );
    }
    // Admissions are buffered per round and fold into the cumulative
    // counters when the round is reported.
    controller.update_round(0, Duration::ZERO);
    assert_eq!(controller.total_requests(), 100);
    assert_eq!(controller.total_requests_throttled(), 0);
}

#[test]
fn test_sustained_overload_converges_above_zero() {
    let controller = ThrottlingController::with_defaults();

    // Every round costs 50ms against a 20ms budget.
    for _ in 0..300 {
        controller.recalculate(1000);
        for _ in 0..100 {
            controller.is_request_throttled();
        }
        controller.update_round(1000, Duration::from_millis(50));
    }

    let throttling = controller.throttling();
    assert!(
        throttling > 0.2 && throttling < 1.0,
        "Sustained overload must settle on a partial drop probability, got {throttling}"
    );
    assert!(controller.rounds_over_target() > 0);
    assert!(
        controller.total_requests_throttled() > 0,
        "With a high drop probability some requests must be shed"
    );
    assert_eq!(controller.total_requests(), 30_000);
    assert_eq!(controller.rounds(), 300);
}

#[test]
fn test_throttling_decays_to_zero_when_load_subsides() {
    let controller = ThrottlingController::new(ThrottleConfig {
        initial_throttling: 0.5,
        ..ThrottleConfig::default()
    });

    for _ in 0..500 {
        controller.recalculate(1);
        for _ in 0..1000 {
            controller.is_request_throttled();
        }
        controller.update_round(1, Duration::from_micros(50));
    }

    assert_eq!(
        controller.throttling(),
        0.0,
        "Light load must drive the drop probability all the way down"
    );
    assert!(controller.rounds_zero_throttling() > 0);
}

#[test]
fn test_stalled_round_does_not_poison_estimate() {
    let controller = ThrottlingController::with_defaults();

    // A normal baseline, then one wildly stalled round.
    for _ in 0..50 {
        controller.recalculate(10);
        controller.update_round(10, Duration::from_micros(100));
    }
    controller.recalculate(10);
    controller.update_round(10, Duration::from_secs(30));

    assert_eq!(controller.rounds_stalled(), 1);
    // The clamp keeps the per-key estimate near the stall allowance
    // instead of three seconds per key.
    assert!(controller.avg_time_per_key() < Duration::from_millis(100));
}

#[test]
fn test_out_of_range_round_times_are_rejected() {
    let controller = ThrottlingController::with_defaults();
    let baseline = controller.avg_time_per_key();
    controller.recalculate(5);
    controller.update_round(5, Duration::from_secs(120));
    assert_eq!(
        controller.avg_time_per_key(),
        baseline,
        "A round above the sanity bound must not touch the estimate"
    );
}

#[test]
fn test_invalid_config_is_rejected() {
    let result = std::panic::catch_unwind(|| {
        ThrottlingController::new(ThrottleConfig {
            throttling_decrease: 1.5,
            ..ThrottleConfig::default()
        })
    });
    assert!(result.is_err(), "A decrease outside [0;1] must be rejected");
}
