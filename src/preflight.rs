//! Preflight checks over raw payroll records
//!
//! Detects the fields the input schema leaves optional but the computation
//! needs, and enriches the region block with the IRPF regime implied by the
//! autonomous community. Detection never mutates the record; resolution
//! applies values through [`apply_value`].

use crate::error::{NominaError, Result};
use serde_json::{json, Value};

/// How a prompted answer is parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Number,
    Text,
    Choice,
}

/// One field the record is missing, with everything needed to ask for it or
/// fall back to a default.
#[derive(Debug, Clone)]
pub struct MissingField {
    pub path: String,
    pub question: String,
    pub hint: String,
    pub kind: FieldKind,
    pub choices: Vec<String>,
    pub default: Option<Value>,
}

impl MissingField {
    fn number(path: &str, question: String, hint: &str, default: Option<Value>) -> Self {
        Self {
            path: path.to_string(),
            question,
            hint: hint.to_string(),
            kind: FieldKind::Number,
            choices: Vec::new(),
            default,
        }
    }

    fn text(path: &str, question: &str, hint: &str, default: &str) -> Self {
        Self {
            path: path.to_string(),
            question: question.to_string(),
            hint: hint.to_string(),
            kind: FieldKind::Text,
            choices: Vec::new(),
            default: Some(json!(default)),
        }
    }
}

/// IRPF regime implied by the autonomous community. Navarre and the Basque
/// Country run their own (foral) tax administrations; everywhere else the
/// state tables apply.
pub fn irpf_regime_for(ccaa: &str) -> Option<&'static str> {
    match ccaa {
        "Comunidad Foral de Navarra" => Some("FORAL_NAVARRA"),
        "País Vasco" => Some("FORAL_PV"),
        "Andalucía" | "Aragón" | "Principado de Asturias" | "Illes Balears" | "Canarias"
        | "Cantabria" | "Castilla-La Mancha" | "Castilla y León" | "Cataluña"
        | "Comunitat Valenciana" | "Extremadura" | "Galicia" | "Comunidad de Madrid"
        | "Región de Murcia" | "La Rioja" | "Ceuta" | "Melilla" => Some("AEAT"),
        _ => None,
    }
}

fn is_blank(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        _ => false,
    }
}

fn get_path<'a>(record: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter()
        .try_fold(record, |current, key| current.get(key))
}

fn has_named_entry(record: &Value, path: &[&str], name: &str) -> bool {
    get_path(record, path)
        .and_then(Value::as_array)
        .map(|items| {
            items.iter().any(|item| {
                item.get("name")
                    .and_then(Value::as_str)
                    .map(|n| n.eq_ignore_ascii_case(name))
                    .unwrap_or(false)
            })
        })
        .unwrap_or(false)
}

/// Fill `region_config.irpf_regime` from the community name when absent.
/// Returns an enriched copy; the input record is left untouched.
pub fn enrich_region(record: &Value) -> Value {
    let mut enriched = record.clone();
    let Some(ccaa) = enriched
        .get("region_config")
        .and_then(|rc| rc.get("ccaa"))
        .and_then(Value::as_str)
        .map(str::to_string)
    else {
        return enriched;
    };
    if let Some(rc) = enriched
        .get_mut("region_config")
        .and_then(Value::as_object_mut)
    {
        rc.entry("notes").or_insert_with(|| json!(""));
        if !rc.contains_key("irpf_regime") {
            if let Some(regime) = irpf_regime_for(&ccaa) {
                rc.insert("irpf_regime".to_string(), json!(regime));
            }
        }
    }
    enriched
}

/// Detect the fields the computation needs but the record does not carry.
pub fn detect_missing(record: &Value) -> Vec<MissingField> {
    let mut missing = Vec::new();

    // Plus Convenio declared by the agreement but with no amount in the
    // compensation variables.
    let plus_in_allowances =
        has_named_entry(record, &["collective_agreement", "allowances"], "plus convenio");
    let plus_in_compensation =
        has_named_entry(record, &["compensation", "variables"], "plus convenio");
    if plus_in_allowances && !plus_in_compensation {
        missing.push(MissingField::number(
            "compensation.plus_convenio_amount",
            "¿Importe mensual del 'Plus Convenio' (€)?".to_string(),
            "Introduce la cuantía bruta mensual.",
            Some(json!(0.0)),
        ));
    }

    // AT/EP tariff cannot be derived without a CNAE code.
    if is_blank(get_path(record, &["company", "cnae"]))
        && is_blank(get_path(record, &["company", "atep_tariff_pct"]))
    {
        missing.push(MissingField::number(
            "company.atep_tariff_pct",
            "Sin CNAE: indica tarifa AT/EP (%) p.ej. 1.50".to_string(),
            "Si conoces el CNAE, mejor añádelo y deja vacío aquí.",
            Some(json!(1.50)),
        ));
    }

    // Contribution and IRPF table years default to the payroll period year.
    // The node is cloned as-is so an integer year stays an integer in the
    // resolved record.
    let period_year = get_path(record, &["period", "year"])
        .filter(|y| y.is_number())
        .cloned();
    let year_example = period_year
        .as_ref()
        .map(Value::to_string)
        .unwrap_or_default();
    if is_blank(get_path(record, &["tables", "cotization_year"])) {
        missing.push(MissingField::number(
            "tables.cotization_year",
            format!("¿Año de tablas de cotización a aplicar? (p.ej. {year_example})"),
            "Normalmente coincide con el año del período.",
            period_year.clone(),
        ));
    }
    if is_blank(get_path(record, &["tables", "irpf_year"])) {
        missing.push(MissingField::number(
            "tables.irpf_year",
            format!("¿Año de tablas IRPF a aplicar? (p.ej. {year_example})"),
            "AEAT o forales del ejercicio.",
            period_year,
        ));
    }

    if is_blank(get_path(record, &["compensation", "base_salary_cra_code"])) {
        missing.push(MissingField::text(
            "compensation.base_salary_cra_code",
            "Código CRA para salario base (p.ej. C01):",
            "Si no sabes, usa C01.",
            "C01",
        ));
    }

    if is_blank(get_path(record, &["worker", "nif"])) {
        missing.push(MissingField::text(
            "worker.nif",
            "NIF del trabajador (formato 12345678Z). Déjalo vacío si no aplica:",
            "No afecta al cálculo pero sí a trazabilidad.",
            "NO-INFORMADO",
        ));
    }

    if is_blank(get_path(record, &["region_config", "irpf_regime"])) {
        missing.push(MissingField {
            path: "region_config.irpf_regime".to_string(),
            question: "Régimen IRPF (AEAT | FORAL_NAVARRA | FORAL_PV):".to_string(),
            hint: "Por defecto: AEAT.".to_string(),
            kind: FieldKind::Choice,
            choices: vec![
                "AEAT".to_string(),
                "FORAL_NAVARRA".to_string(),
                "FORAL_PV".to_string(),
            ],
            default: Some(json!("AEAT")),
        });
    }

    missing
}

/// Parse a prompted answer according to the field kind. Numbers accept a
/// comma decimal separator; choices must match one of the declared options.
pub fn parse_answer(raw: &str, field: &MissingField) -> Result<Value> {
    let trimmed = raw.trim();
    match field.kind {
        FieldKind::Number => {
            let normalized = trimmed.replace(',', ".");
            let number: f64 = normalized.parse().map_err(|_| {
                NominaError::MissingField(format!(
                    "{} ('{trimmed}' is not a number)",
                    field.path
                ))
            })?;
            Ok(json!(number))
        }
        FieldKind::Choice => {
            if field.choices.iter().any(|c| c == trimmed) {
                Ok(json!(trimmed))
            } else {
                Err(NominaError::MissingField(format!(
                    "{} ('{trimmed}' is not one of {})",
                    field.path,
                    field.choices.join(", ")
                )))
            }
        }
        FieldKind::Text => Ok(json!(trimmed)),
    }
}

fn set_by_path(root: &mut Value, path: &str, value: Value) {
    let parts: Vec<&str> = path.split('.').collect();
    let mut current = root;
    for part in &parts[..parts.len() - 1] {
        if !current.get(*part).map(Value::is_object).unwrap_or(false) {
            if let Some(obj) = current.as_object_mut() {
                obj.insert(part.to_string(), json!({}));
            }
        }
        // A non-object node (record root is an array, say) cannot take the
        // value; the schema check reports that case on its own.
        match current.get_mut(*part) {
            Some(next) => current = next,
            None => return,
        }
    }
    if let Some(obj) = current.as_object_mut() {
        obj.insert(parts[parts.len() - 1].to_string(), value);
    }
}

/// Apply a resolved value to the record. The Plus Convenio amount is not a
/// plain path: it lands as an entry of `compensation.variables`.
pub fn apply_value(record: &mut Value, field: &MissingField, value: Value) {
    if field.path == "compensation.plus_convenio_amount" {
        let amount = value.as_f64().unwrap_or(0.0);
        if !record.get("compensation").map(Value::is_object).unwrap_or(false) {
            set_by_path(record, "compensation", json!({}));
        }
        let Some(compensation) = record
            .get_mut("compensation")
            .and_then(Value::as_object_mut)
        else {
            return;
        };
        let variables = compensation
            .entry("variables")
            .or_insert_with(|| json!([]));
        if let Some(items) = variables.as_array_mut() {
            let existing = items.iter_mut().find(|item| {
                item.get("name")
                    .and_then(Value::as_str)
                    .map(|n| n.eq_ignore_ascii_case("plus convenio"))
                    .unwrap_or(false)
            });
            match existing {
                Some(entry) => {
                    if let Some(obj) = entry.as_object_mut() {
                        obj.insert("amount".to_string(), json!(amount));
                    }
                }
                None => items.push(json!({
                    "name": "Plus Convenio",
                    "taxable": true,
                    "contributory": true,
                    "cra_code": "C02",
                    "amount": amount,
                })),
            }
        }
        return;
    }
    set_by_path(record, &field.path, value);
}
