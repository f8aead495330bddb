use stockledger::{
    Ledger, LedgerError, LedgerSettings, MovementFilter, MovementType, ProductId, SaleLine,
    CHECKOUT_ACTOR,
};

fn stocked_ledger() -> Ledger {
    let ledger = Ledger::in_memory(LedgerSettings::default()).unwrap();
    ledger.initialize("tea", 10, None, Some("operator:1")).unwrap();
    ledger.initialize("mug", 3, None, Some("operator:1")).unwrap();
    ledger.initialize("spoon", 1, None, Some("operator:1")).unwrap();
    ledger
}

fn qty(ledger: &Ledger, id: &str) -> i64 {
    ledger.get_current(&ProductId::from(id)).unwrap().quantity_on_hand
}

#[test]
fn test_commit_sale_records_every_line() {
    let ledger = stocked_ledger();
    let receipt = ledger
        .commit_sale("ord-1001", &[SaleLine::new("tea", 2), SaleLine::new("mug", 1)])
        .unwrap();

    assert_eq!(receipt.order_ref, "ord-1001");
    assert_eq!(receipt.movements.len(), 2);
    assert!(receipt.movements.iter().all(|m| {
        m.movement_type == MovementType::Sale
            && m.actor.as_deref() == Some(CHECKOUT_ACTOR)
            && m.reason.as_deref() == Some("order ord-1001")
    }));
    assert_eq!(qty(&ledger, "tea"), 8);
    assert_eq!(qty(&ledger, "mug"), 2);
}

#[test]
fn test_failed_line_reverses_earlier_lines() {
    let ledger = stocked_ledger();
    let err = ledger
        .commit_sale(
            "ord-1002",
            &[
                SaleLine::new("tea", 4),
                SaleLine::new("mug", 2),
                SaleLine::new("spoon", 2),
            ],
        )
        .unwrap_err();

    assert_eq!(err.failed_line, Some(2));
    assert!(matches!(err.cause, LedgerError::InsufficientStock { .. }));
    assert!(err.is_fully_compensated());
    assert_eq!(err.compensations.len(), 2);
    // Compensated newest first
    assert_eq!(err.compensations[0].product_id, ProductId::from("mug"));
    assert_eq!(err.compensations[0].quantity_delta, 2);
    assert!(err.compensations[0]
        .reason
        .as_deref()
        .is_some_and(|r| r.starts_with("order ord-1002 aborted")));

    assert_eq!(qty(&ledger, "tea"), 10);
    assert_eq!(qty(&ledger, "mug"), 3);
    assert_eq!(qty(&ledger, "spoon"), 1);

    let reversals = ledger
        .list_recent(None, &MovementFilter::of_type(MovementType::Adjustment))
        .unwrap();
    assert_eq!(reversals.len(), 2);
    assert!(ledger.reconcile_all().unwrap().iter().all(|r| r.is_clean()));
}

#[test]
fn test_first_line_failure_needs_no_compensation() {
    let ledger = stocked_ledger();
    let err = ledger
        .commit_sale("ord-1003", &[SaleLine::new("unknown", 1), SaleLine::new("tea", 1)])
        .unwrap_err();
    assert_eq!(err.failed_line, Some(0));
    assert!(matches!(err.cause, LedgerError::NotFound { .. }));
    assert!(err.compensations.is_empty());
    assert_eq!(qty(&ledger, "tea"), 10);
}

#[test]
fn test_rejects_empty_orders() {
    let ledger = stocked_ledger();
    let err = ledger.commit_sale("ord-1004", &[]).unwrap_err();
    assert!(matches!(err.cause, LedgerError::Validation(_)));
    assert_eq!(err.failed_line, None);

    let err = ledger.commit_sale("  ", &[SaleLine::new("tea", 1)]).unwrap_err();
    assert!(matches!(err.cause, LedgerError::Validation(_)));
    assert_eq!(qty(&ledger, "tea"), 10);
}
