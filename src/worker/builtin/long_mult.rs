//! Long multiplication, split over three analyses.
//!
//! `DigitFactory` fans out one `PartMultiply` job per distinct digit of
//! `b_multiplier` (0 and 1 are trivial and skipped). Each `PartMultiply`
//! multiplies `a_multiplier` by its digit and its result is accumulated, keyed by
//! digit, into the funnel. `AddTogether` runs when the fan is done and sums the
//! shifted partial products.

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use crate::worker::runnable::{JobContext, JobError, Runnable};

pub struct DigitFactory;

#[async_trait]
impl Runnable for DigitFactory {
    fn param_defaults(&self) -> Map<String, Value> {
        let mut defaults = Map::new();
        defaults.insert("take_time".to_string(), json!(0));
        defaults
    }

    async fn fetch_input(&self, ctx: &mut JobContext) -> Result<(), JobError> {
        let b_multiplier = digits_param(ctx, "b_multiplier")?;
        let digits: BTreeSet<char> = b_multiplier.chars().filter(|c| *c != '0' && *c != '1').collect();
        let sub_tasks: Vec<Value> = digits.into_iter().map(|d| json!({ "digit": d.to_string() })).collect();
        ctx.set_param("sub_tasks", Value::Array(sub_tasks))
    }

    async fn run(&self, ctx: &mut JobContext) -> Result<(), JobError> {
        super::take_time(ctx).await
    }

    async fn write_output(&self, ctx: &mut JobContext) -> Result<(), JobError> {
        let sub_tasks = match ctx.param_required("sub_tasks")? {
            Value::Array(tasks) => tasks,
            other => return Err(JobError::Fatal(format!("sub_tasks is not a list: {other}"))),
        };
        ctx.warning(format!("{} multiplication jobs have been created", sub_tasks.len()), false);
        ctx.dataflow(2, sub_tasks);
        Ok(())
    }
}

pub struct PartMultiply;

#[async_trait]
impl Runnable for PartMultiply {
    fn param_defaults(&self) -> Map<String, Value> {
        let mut defaults = Map::new();
        defaults.insert("take_time".to_string(), json!(0));
        defaults
    }

    async fn run(&self, ctx: &mut JobContext) -> Result<(), JobError> {
        let a_multiplier = digits_param(ctx, "a_multiplier")?;
        let digit = digits_param(ctx, "digit")?;
        let digit = match digit.as_bytes() {
            [d] => u32::from(d - b'0'),
            _ => return Err(JobError::Fatal(format!("digit must be a single digit, got {digit:?}"))),
        };
        ctx.set_param("partial_product", json!(multiply_by_digit(&a_multiplier, digit)))?;
        super::take_time(ctx).await
    }

    async fn write_output(&self, ctx: &mut JobContext) -> Result<(), JobError> {
        let product = ctx.param_required("partial_product")?;
        ctx.dataflow_one(1, json!({ "partial_product": product }));
        Ok(())
    }
}

pub struct AddTogether;

#[async_trait]
impl Runnable for AddTogether {
    fn param_defaults(&self) -> Map<String, Value> {
        let mut defaults = Map::new();
        defaults.insert("take_time".to_string(), json!(0));
        defaults.insert("partial_product".to_string(), json!({}));
        defaults
    }

    async fn fetch_input(&self, ctx: &mut JobContext) -> Result<(), JobError> {
        let a_multiplier = digits_param(ctx, "a_multiplier")?;
        let mut partial_product = match ctx.param_required("partial_product")? {
            Value::Object(map) => map,
            other => return Err(JobError::Fatal(format!("partial_product is not a map: {other}"))),
        };
        partial_product.insert("1".to_string(), json!(a_multiplier));
        partial_product.insert("0".to_string(), json!("0"));
        ctx.set_param("partial_product", Value::Object(partial_product))
    }

    async fn run(&self, ctx: &mut JobContext) -> Result<(), JobError> {
        let b_multiplier = digits_param(ctx, "b_multiplier")?;
        let partial_product = match ctx.param_required("partial_product")? {
            Value::Object(map) => map,
            other => return Err(JobError::Fatal(format!("partial_product is not a map: {other}"))),
        };
        let mut products = std::collections::HashMap::new();
        for (digit, product) in &partial_product {
            let product = match product {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            products.insert(digit.clone(), product);
        }
        let result = add_together(&b_multiplier, &products)?;
        ctx.set_param("result", json!(result))?;
        super::take_time(ctx).await
    }

    async fn write_output(&self, ctx: &mut JobContext) -> Result<(), JobError> {
        let result = ctx.param_required("result")?;
        ctx.dataflow_one(1, json!({ "result": result }));
        Ok(())
    }
}

/// A non-negative integer parameter as its decimal digits.
fn digits_param(ctx: &mut JobContext, name: &str) -> Result<String, JobError> {
    let digits = ctx.param_string(name)?;
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(JobError::Fatal(format!("parameter '{name}' is not a number: {digits:?}")));
    }
    Ok(digits)
}

/// Multiply a decimal string by a single digit.
pub fn multiply_by_digit(number: &str, digit: u32) -> String {
    let mut out = Vec::with_capacity(number.len() + 1);
    let mut carry = 0;
    for c in number.bytes().rev() {
        let product = u32::from(c - b'0') * digit + carry;
        out.push(b'0' + (product % 10) as u8);
        carry = product / 10;
    }
    if carry > 0 {
        out.push(b'0' + carry as u8);
    }
    out.reverse();
    trim_leading_zeros(String::from_utf8_lossy(&out).into_owned())
}

/// Sum the partial products of every digit of `b_multiplier`, each shifted by
/// its position.
pub fn add_together(
    b_multiplier: &str,
    partial_product: &std::collections::HashMap<String, String>,
) -> Result<String, JobError> {
    let widest = partial_product.values().map(String::len).max().unwrap_or(0);
    let mut accu = vec![0u32; 1 + b_multiplier.len() + widest];

    for (i, b_digit) in b_multiplier.chars().rev().enumerate() {
        let product = partial_product
            .get(&b_digit.to_string())
            .ok_or_else(|| JobError::Fatal(format!("no partial product for digit {b_digit}")))?;
        for (j, p_digit) in product.chars().rev().enumerate() {
            let value = p_digit
                .to_digit(10)
                .ok_or_else(|| JobError::Fatal(format!("partial product {product:?} is not a number")))?;
            accu[i + j] += value;
        }
    }

    let mut carry = 0;
    for slot in accu.iter_mut() {
        let value = carry + *slot;
        *slot = value % 10;
        carry = value / 10;
    }

    let digits: String = accu.iter().rev().map(|d| char::from(b'0' + *d as u8)).collect();
    Ok(trim_leading_zeros(digits))
}

fn trim_leading_zeros(digits: String) -> String {
    let trimmed = digits.trim_start_matches('0');
    if trimmed.is_empty() {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}
