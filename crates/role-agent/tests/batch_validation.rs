use role_agent::batch::{BatchError, check_batch_inputs, check_rows, parse_csv};
use role_agent::prompt::{PromptVariable, VarType};

fn vars() -> Vec<PromptVariable> {
    let mut q = PromptVariable::new("query", "Query", VarType::String);
    q.max_length = Some(5);
    let mut ctx = PromptVariable::new("context", "Context", VarType::Paragraph);
    ctx.required = Some(false);
    vec![q, ctx]
}

#[test]
fn cleaned_rows_revalidate_without_header() {
    let data = parse_csv("Query,Context\nabc,x\n\"a,b\",\"multi\nline\"\n\n").unwrap();
    let rows = check_batch_inputs(&data, &vars(), 48).unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[1], vec!["a,b", "multi\nline"]);
    assert_eq!(check_rows(&rows, &vars(), 48).unwrap(), rows);
}

#[test]
fn blank_line_between_rows_is_rejected() {
    let data = parse_csv("Query,Context\nabc,\n,\nxyz,\n").unwrap();
    assert_eq!(
        check_batch_inputs(&data, &vars(), 48),
        Err(BatchError::GapBlankLine { row: 3 })
    );
}

#[test]
fn inch_marks_do_not_swallow_following_rows() {
    let vars = vec![PromptVariable::new("query", "Query", VarType::String)];
    let data = parse_csv("Query\nCompare a 5\" screen\nSecond question\nThird question\n").unwrap();
    let rows = check_batch_inputs(&data, &vars, 48).unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0], vec!["Compare a 5\" screen"]);

    let gap = parse_csv("Query,Context\nA 5\" x,\n\nB,\n").unwrap();
    assert_eq!(
        check_batch_inputs(&gap, &crate::vars(), 48),
        Err(BatchError::GapBlankLine { row: 3 })
    );
}

#[test]
fn trailing_blank_lines_are_stripped() {
    let data = parse_csv("Query,Context\nabc,\nxyz,\n\n\n").unwrap();
    assert_eq!(check_batch_inputs(&data, &vars(), 48).unwrap().len(), 2);
}

#[test]
fn length_limit_is_inclusive() {
    let ok = parse_csv("Query,Context\nabcde,\n").unwrap();
    assert!(check_batch_inputs(&ok, &vars(), 48).is_ok());

    let long = parse_csv("Query,Context\nabcdef,\n").unwrap();
    let err = check_batch_inputs(&long, &vars(), 48).unwrap_err();
    assert_eq!(
        err,
        BatchError::ExceedsMaxLength {
            row: 2,
            var: "Query".into(),
            max: 5
        }
    );
    assert_eq!(
        err.to_string(),
        "Row 2: Query value can not be more than 5 characters"
    );
}

#[test]
fn structural_errors() {
    assert_eq!(check_batch_inputs(&[], &vars(), 48), Err(BatchError::Empty));

    let wrong = parse_csv("Question,Context\nabc,\n").unwrap();
    assert_eq!(
        check_batch_inputs(&wrong, &vars(), 48),
        Err(BatchError::HeaderMismatch)
    );

    let header_only = parse_csv("Query,Context\n").unwrap();
    assert_eq!(
        check_batch_inputs(&header_only, &vars(), 48),
        Err(BatchError::NoRows)
    );

    let missing = parse_csv("Query,Context\n,some context\n").unwrap();
    assert_eq!(
        check_batch_inputs(&missing, &vars(), 48),
        Err(BatchError::MissingRequired {
            row: 2,
            var: "Query".into()
        })
    );
}
