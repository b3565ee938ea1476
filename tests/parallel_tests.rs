mod common;

use std::collections::HashMap;
use std::sync::Arc;

use common::*;
use mailblast::{CampaignParams, ProgressEvent, Recipient, TemplateBlock};

fn recipients(prefix: &str, count: usize) -> Vec<Recipient> {
    (0..count)
        .map(|i| Recipient {
            email: format!("{prefix}{i}@example.com"),
            data: HashMap::new(),
        })
        .collect()
}

/// Two campaigns race one account with a daily cap of 100. The unlocked
/// select-send-increment window allows an overshoot of at most one send per
/// extra campaign; everything else defers to the queue.
#[tokio::test]
async fn parallel_campaigns_respect_the_soft_daily_cap() {
    let factory = Arc::new(MockFactory::default());
    let (engine, _dir) = test_engine(factory.clone()).await;

    let account_id = engine
        .accounts
        .insert_account(account("shared", 100, 1000, 0))
        .await
        .unwrap();

    let body = vec![TemplateBlock::Text {
        text: "load test".into(),
    }];

    let rx_a = engine.run_campaign(CampaignParams::new(
        "parallel-a",
        body.clone(),
        "Subject",
        recipients("a", 60),
    ));
    let rx_b = engine.run_campaign(CampaignParams::new(
        "parallel-b",
        body,
        "Subject",
        recipients("b", 60),
    ));

    let (events_a, events_b) = tokio::join!(collect_events(rx_a), collect_events(rx_b));

    let mut totals = (0i64, 0i64, 0i64);
    for events in [&events_a, &events_b] {
        let ProgressEvent::Complete {
            successful,
            failed,
            queued,
            ..
        } = events.last().unwrap()
        else {
            panic!("missing complete event");
        };

        // Every recipient is accounted for in its own campaign.
        assert_eq!(successful + failed + queued, 60);
        assert_eq!(*failed, 0);

        totals.0 += successful;
        totals.1 += failed;
        totals.2 += queued;
    }

    // Soft cap: at most dailyCap + (parallelism - 1) sends in total.
    assert!(totals.0 <= 101, "sent {} > soft cap", totals.0);
    assert!(totals.0 >= 100, "sent {} < daily cap", totals.0);
    assert_eq!(totals.0 + totals.2, 120);

    let tallied = send_count_today(&engine, account_id).await;
    assert_eq!(tallied, totals.0);
    assert_eq!(factory.sent_messages().len() as i64, totals.0);
}
