use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::{
    cmp::Ordering,
    collections::HashMap,
    fs::{self, File},
    io::{BufRead, BufReader, BufWriter, Write},
    path::PathBuf,
};

use crate::error::{FlowError, Result};
use crate::steps::{StepLogic, StepRegistry};
use crate::wordcount::normalize_token;
use crate::Record;

/* =========================
   Registros JSON
   ========================= */

/// Los steps nativos trabajan sobre registros JSON; el transporte sólo ve bytes.
pub fn parse_record(record: &[u8]) -> Result<Value> {
    serde_json::from_slice(record)
        .map_err(|e| FlowError::StepLogic(format!("registro no es JSON válido: {e}")))
}

pub fn encode_record(value: &Value) -> Result<Record> {
    Ok(serde_json::to_vec(value)?)
}

/// Forma textual de una clave: strings tal cual, el resto como JSON.
/// `"7"` y `7` comparten forma canónica.
pub fn canonical_key(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Orden total para claves: números numéricamente, strings lexicográficamente;
/// tipos distintos se ordenan por tipo.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => type_rank(a)
            .cmp(&type_rank(b))
            .then_with(|| a.to_string().cmp(&b.to_string())),
    }
}

fn param_str<'a>(params: &'a Value, name: &str, default: &'a str) -> &'a str {
    params.get(name).and_then(|v| v.as_str()).unwrap_or(default)
}

/* =========================
   Steps map-like
   ========================= */

struct Identity;

impl StepLogic for Identity {
    fn process(&mut self, _input: usize, record: Record, out: &mut Vec<Record>) -> Result<()> {
        out.push(record);
        Ok(())
    }
}

/// Valida que cada línea sea JSON y la normaliza.
struct ParseJson;

impl StepLogic for ParseJson {
    fn process(&mut self, _input: usize, record: Record, out: &mut Vec<Record>) -> Result<()> {
        if record.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(());
        }
        out.push(encode_record(&parse_record(&record)?)?);
        Ok(())
    }
}

/// Texto → un registro `{"token": w}` por palabra normalizada. Acepta un
/// objeto con el campo de texto, un string JSON o una línea cruda.
struct Tokenize {
    field: String,
}

impl Tokenize {
    fn text_of(&self, record: &[u8]) -> String {
        match serde_json::from_slice::<Value>(record) {
            Ok(Value::Object(obj)) => obj
                .get(&self.field)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            Ok(Value::String(s)) => s,
            _ => String::from_utf8_lossy(record).to_string(),
        }
    }
}

impl StepLogic for Tokenize {
    fn process(&mut self, _input: usize, record: Record, out: &mut Vec<Record>) -> Result<()> {
        let text = self.text_of(&record);
        for raw in text.split_whitespace() {
            if let Some(token) = normalize_token(raw) {
                out.push(encode_record(&json!({ "token": token }))?);
            }
        }
        Ok(())
    }
}

struct ToLower {
    field: String,
}

impl StepLogic for ToLower {
    fn process(&mut self, _input: usize, record: Record, out: &mut Vec<Record>) -> Result<()> {
        let mut value = parse_record(&record)?;
        if let Some(s) = value.get(&self.field).and_then(|v| v.as_str()) {
            let lowered = s.to_lowercase();
            value[&self.field] = Value::String(lowered);
        }
        out.push(encode_record(&value)?);
        Ok(())
    }
}

/// `{key: k, ...}` → `{key: k, value: 1}`.
struct PairWithOne {
    key: String,
    value: String,
}

impl StepLogic for PairWithOne {
    fn process(&mut self, _input: usize, record: Record, out: &mut Vec<Record>) -> Result<()> {
        let rec = parse_record(&record)?;
        let Some(k) = rec.get(&self.key) else {
            return Ok(());
        };
        let mut obj = Map::new();
        obj.insert(self.key.clone(), k.clone());
        obj.insert(self.value.clone(), json!(1_u64));
        out.push(encode_record(&Value::Object(obj))?);
        Ok(())
    }
}

/// Deja pasar sólo registros cuyo campo es un string no vacío.
struct FilterNonEmpty {
    field: String,
}

impl StepLogic for FilterNonEmpty {
    fn process(&mut self, _input: usize, record: Record, out: &mut Vec<Record>) -> Result<()> {
        let keep = parse_record(&record)?
            .get(&self.field)
            .and_then(|v| v.as_str())
            .map(|s| !s.trim().is_empty())
            .unwrap_or(false);
        if keep {
            out.push(record);
        }
        Ok(())
    }
}

/* =========================
   Agregación con spill
   ========================= */

/// Parámetros de `sum_by_key`. Al llegar a `max_keys` claves vivas el mapa
/// se vuelca como un run a `spill_dir`; sin `spill_dir`, bajo el temp del SO.
#[derive(Debug, Deserialize)]
#[serde(default)]
struct SumByKeyParams {
    key: String,
    value: String,
    max_keys: usize,
    spill_dir: Option<PathBuf>,
}

impl Default for SumByKeyParams {
    fn default() -> Self {
        Self {
            key: "token".to_string(),
            value: "count".to_string(),
            max_keys: 50_000,
            spill_dir: None,
        }
    }
}

impl SumByKeyParams {
    fn parse(params: &Value) -> Result<Self> {
        if params.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(params.clone())
            .map_err(|e| FlowError::StepLogic(format!("parámetros de sum_by_key inválidos: {e}")))
    }
}

/// Una línea de run: clave en texto JSON y suma parcial.
#[derive(Serialize, Deserialize)]
struct RunEntry {
    k: String,
    v: i64,
}

fn accumulate(sums: &mut HashMap<String, i64>, key: String, value: i64) -> Result<()> {
    let total = sums
        .get(&key)
        .copied()
        .unwrap_or(0)
        .checked_add(value)
        .ok_or_else(|| FlowError::StepLogic(format!("la suma de la clave {key} desborda i64")))?;
    sums.insert(key, total);
    Ok(())
}

/// Sumas por clave con runs en disco cuando hay demasiadas claves vivas.
/// Las claves se guardan como texto JSON para recuperar su tipo al final.
struct KeyedSums {
    live: HashMap<String, i64>,
    runs: Vec<PathBuf>,
    dir: PathBuf,
    max_keys: usize,
}

impl KeyedSums {
    fn new(dir: PathBuf, max_keys: usize) -> Self {
        Self {
            live: HashMap::new(),
            runs: Vec::new(),
            dir,
            max_keys: max_keys.max(1),
        }
    }

    fn add(&mut self, key: String, value: i64) -> Result<()> {
        accumulate(&mut self.live, key, value)?;
        if self.live.len() >= self.max_keys {
            self.write_run()?;
        }
        Ok(())
    }

    fn write_run(&mut self) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(format!("run-{}.jsonl", self.runs.len()));
        let mut writer = BufWriter::new(File::create(&path)?);
        for (k, v) in self.live.drain() {
            serde_json::to_writer(&mut writer, &RunEntry { k, v })?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        self.runs.push(path);
        Ok(())
    }

    /// Mezcla lo vivo con los runs; entradas ordenadas por clave.
    fn finalize(&mut self) -> Result<Vec<(String, i64)>> {
        let mut sums: HashMap<String, i64> = self.live.drain().collect();
        for path in &self.runs {
            for line in BufReader::new(File::open(path)?).lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let entry: RunEntry = serde_json::from_str(&line).map_err(|e| {
                    FlowError::StepLogic(format!("run corrupto en {}: {e}", path.display()))
                })?;
                accumulate(&mut sums, entry.k, entry.v)?;
            }
        }
        self.cleanup();

        let mut entries: Vec<(String, i64)> = sums.into_iter().collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }

    fn cleanup(&mut self) {
        if !self.runs.is_empty() {
            let _ = fs::remove_dir_all(&self.dir);
            self.runs.clear();
        }
    }
}

impl Drop for KeyedSums {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// reduce: suma `value` agrupando por `key`; emite al final, ordenado por clave.
struct SumByKey {
    key: String,
    value: String,
    sums: KeyedSums,
}

impl SumByKey {
    fn from_params(params: &Value) -> Result<Self> {
        let p = SumByKeyParams::parse(params)?;
        let dir = p
            .spill_dir
            .unwrap_or_else(|| std::env::temp_dir().join("flow-agg"))
            .join(uuid::Uuid::new_v4().to_string());
        Ok(Self {
            key: p.key,
            value: p.value,
            sums: KeyedSums::new(dir, p.max_keys),
        })
    }
}

impl StepLogic for SumByKey {
    fn process(&mut self, _input: usize, record: Record, _out: &mut Vec<Record>) -> Result<()> {
        let rec = parse_record(&record)?;
        let key = rec.get(&self.key);
        let val = rec.get(&self.value).and_then(|v| v.as_i64());
        if let (Some(k), Some(v)) = (key, val) {
            self.sums.add(k.to_string(), v)?;
        }
        Ok(())
    }

    fn finish(&mut self, out: &mut Vec<Record>) -> Result<()> {
        for (k, v) in self.sums.finalize()? {
            let key: Value = serde_json::from_str(&k)?;
            let mut obj = Map::new();
            obj.insert(self.key.clone(), key);
            obj.insert(self.value.clone(), json!(v));
            out.push(encode_record(&Value::Object(obj))?);
        }
        Ok(())
    }
}

/* =========================
   JOIN
   ========================= */

/// Fusiona dos registros JSON en uno solo.
/// - la clave derecha se descarta (ya está representada por la izquierda)
/// - si un campo existe en ambos lados, se respeta el del lado izquierdo
///   y el del derecho se guarda con prefijo `right_`.
fn merge_records(left: &Value, right: &Value, right_key: &str) -> Value {
    let mut obj = Map::new();

    if let Some(lobj) = left.as_object() {
        for (k, v) in lobj {
            obj.insert(k.clone(), v.clone());
        }
    }

    if let Some(robj) = right.as_object() {
        for (k, v) in robj {
            if k == right_key {
                continue;
            }
            if obj.contains_key(k) {
                obj.insert(format!("right_{}", k), v.clone());
            } else {
                obj.insert(k.clone(), v.clone());
            }
        }
    }

    Value::Object(obj)
}

/// Inner join: la entrada 0 (izquierda) se indexa completa; cada registro de
/// la entrada 1 (derecha) emite un registro combinado por coincidencia.
struct Join {
    left_key: String,
    right_key: String,
    index: HashMap<String, Vec<Value>>,
}

impl StepLogic for Join {
    fn process(&mut self, input: usize, record: Record, out: &mut Vec<Record>) -> Result<()> {
        let rec = parse_record(&record)?;
        match input {
            0 => {
                if let Some(k) = rec.get(&self.left_key) {
                    self.index.entry(canonical_key(k)).or_default().push(rec);
                }
            }
            1 => {
                let Some(k) = rec.get(&self.right_key) else {
                    return Ok(());
                };
                if let Some(matches) = self.index.get(&canonical_key(k)) {
                    for left in matches {
                        out.push(encode_record(&merge_records(left, &rec, &self.right_key))?);
                    }
                }
            }
            other => {
                return Err(FlowError::StepLogic(format!(
                    "join espera 2 entradas, recibió la entrada {other}"
                )))
            }
        }
        Ok(())
    }
}

/* =========================
   SORT
   ========================= */

/// Ordena la partición completa por `key` (orden estable).
struct SortByKey {
    key: String,
    buffer: Vec<(Value, Record)>,
}

impl StepLogic for SortByKey {
    fn process(&mut self, _input: usize, record: Record, _out: &mut Vec<Record>) -> Result<()> {
        let key = parse_record(&record)?
            .get(&self.key)
            .cloned()
            .unwrap_or(Value::Null);
        self.buffer.push((key, record));
        Ok(())
    }

    fn finish(&mut self, out: &mut Vec<Record>) -> Result<()> {
        let mut buffer = std::mem::take(&mut self.buffer);
        buffer.sort_by(|a, b| compare_values(&a.0, &b.0));
        out.extend(buffer.into_iter().map(|(_, r)| r));
        Ok(())
    }
}

/* =========================
   Registro de built-ins
   ========================= */

pub fn register_builtins(r: &mut StepRegistry) {
    r.register_step("identity", |_| Ok(Box::new(Identity)));
    r.register_step("parse_json", |_| Ok(Box::new(ParseJson)));
    r.register_step("tokenize", |p| {
        Ok(Box::new(Tokenize {
            field: param_str(p, "field", "text").to_string(),
        }))
    });
    r.register_step("to_lower", |p| {
        Ok(Box::new(ToLower {
            field: param_str(p, "field", "token").to_string(),
        }))
    });
    r.register_step("pair_with_one", |p| {
        Ok(Box::new(PairWithOne {
            key: param_str(p, "key", "token").to_string(),
            value: param_str(p, "value", "count").to_string(),
        }))
    });
    r.register_step("filter_nonempty", |p| {
        Ok(Box::new(FilterNonEmpty {
            field: param_str(p, "field", "token").to_string(),
        }))
    });
    r.register_step("sum_by_key", |p| Ok(Box::new(SumByKey::from_params(p)?)));
    r.register_step("join", |p| {
        let key = param_str(p, "key", "id");
        Ok(Box::new(Join {
            left_key: param_str(p, "left_key", key).to_string(),
            right_key: param_str(p, "right_key", key).to_string(),
            index: HashMap::new(),
        }))
    });
    r.register_step("sort_by_key", |p| {
        Ok(Box::new(SortByKey {
            key: param_str(p, "key", "key").to_string(),
            buffer: Vec::new(),
        }))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::StepArtifact;
    use std::{env, path::PathBuf};

    fn temp_dir(sub: &str) -> PathBuf {
        let base = env::temp_dir().join("engine_tests").join(sub);
        let _ = fs::remove_dir_all(&base);
        fs::create_dir_all(&base).unwrap();
        base
    }

    fn rec(v: Value) -> Record {
        serde_json::to_vec(&v).unwrap()
    }

    fn run(artifact: StepArtifact, inputs: Vec<(usize, Record)>) -> Vec<Value> {
        let reg = StepRegistry::with_builtins();
        let mut logic = reg.instantiate(&artifact).unwrap();
        let mut out = Vec::new();
        for (i, r) in inputs {
            logic.process(i, r, &mut out).unwrap();
        }
        logic.finish(&mut out).unwrap();
        out.iter().map(|r| parse_record(r).unwrap()).collect()
    }

    /* ============
       OPERADORES
       ============ */

    #[test]
    fn tokenize_acepta_lineas_crudas_y_objetos() {
        let out = run(
            StepArtifact::native("tokenize"),
            vec![
                (0, b"Hola hola, mundo!!".to_vec()),
                (0, rec(json!({"text": "mundo_prueba"}))),
            ],
        );
        assert_eq!(
            out,
            vec![
                json!({"token": "hola"}),
                json!({"token": "hola"}),
                json!({"token": "mundo"}),
                json!({"token": "mundo_prueba"}),
            ]
        );
    }

    #[test]
    fn pair_with_one_y_filter_nonempty() {
        let out = run(
            StepArtifact::native("filter_nonempty"),
            vec![(0, rec(json!({"token": " "}))), (0, rec(json!({"token": "a"})))],
        );
        assert_eq!(out, vec![json!({"token": "a"})]);

        let out = run(
            StepArtifact::native("pair_with_one"),
            vec![(0, rec(json!({"token": "a", "extra": true})))],
        );
        assert_eq!(out, vec![json!({"token": "a", "count": 1})]);
    }

    #[test]
    fn sum_by_key_agrupa_y_suma_ordenado() {
        let out = run(
            StepArtifact::native("sum_by_key"),
            vec![
                (0, rec(json!({"token": "b", "count": 1}))),
                (0, rec(json!({"token": "a", "count": 1}))),
                (0, rec(json!({"token": "a", "count": 1}))),
            ],
        );
        assert_eq!(
            out,
            vec![
                json!({"token": "a", "count": 2}),
                json!({"token": "b", "count": 1}),
            ]
        );
    }

    #[test]
    fn sumas_por_clave_vuelcan_runs_y_los_mezclan() {
        let tmp = temp_dir("runs");

        // max_keys = 2: la segunda clave viva dispara un run
        let mut sums = KeyedSums::new(tmp.join("runs"), 2);
        sums.add("\"a\"".to_string(), 1).unwrap();
        sums.add("\"b\"".to_string(), 1).unwrap();
        sums.add("\"a\"".to_string(), 2).unwrap();
        assert_eq!(sums.runs.len(), 1);

        let entries = sums.finalize().unwrap();
        assert_eq!(
            entries,
            vec![("\"a\"".to_string(), 3), ("\"b\"".to_string(), 1)]
        );
        assert!(!tmp.join("runs").exists());
    }

    #[test]
    fn sum_by_key_con_runs_da_lo_mismo() {
        let tmp = temp_dir("sum_runs");
        let params = json!({
            "max_keys": 1,
            "spill_dir": tmp.to_string_lossy(),
        });
        let input: Vec<(usize, Record)> = ["x", "y", "x", "z", "x"]
            .iter()
            .map(|t| (0, rec(json!({"token": t, "count": 1}))))
            .collect();
        let out = run(StepArtifact::native_with("sum_by_key", params), input);
        assert_eq!(
            out,
            vec![
                json!({"token": "x", "count": 3}),
                json!({"token": "y", "count": 1}),
                json!({"token": "z", "count": 1}),
            ]
        );
    }

    #[test]
    fn parametros_de_sum_by_key_toman_defaults_y_rechazan_tipos_malos() {
        let p = SumByKeyParams::parse(&Value::Null).unwrap();
        assert_eq!((p.key.as_str(), p.value.as_str()), ("token", "count"));
        assert_eq!(p.max_keys, 50_000);
        assert!(p.spill_dir.is_none());

        let p = SumByKeyParams::parse(&json!({"key": "w", "max_keys": 10})).unwrap();
        assert_eq!((p.key.as_str(), p.value.as_str(), p.max_keys), ("w", "count", 10));

        let reg = StepRegistry::with_builtins();
        let err = reg
            .instantiate(&StepArtifact::native_with("sum_by_key", json!({"max_keys": "mucho"})))
            .err()
            .unwrap();
        assert!(matches!(err, FlowError::StepLogic(_)));
    }

    #[test]
    fn suma_que_desborda_es_error_del_step() {
        let reg = StepRegistry::with_builtins();
        let mut logic = reg.instantiate(&StepArtifact::native("sum_by_key")).unwrap();
        let mut out = Vec::new();
        logic
            .process(0, rec(json!({"token": "a", "count": i64::MAX})), &mut out)
            .unwrap();
        let err = logic
            .process(0, rec(json!({"token": "a", "count": 1})), &mut out)
            .unwrap_err();
        assert!(matches!(err, FlowError::StepLogic(_)));
    }

    #[test]
    fn desborde_al_mezclar_runs_tambien_es_error() {
        let tmp = temp_dir("overflow_runs");
        let mut sums = KeyedSums::new(tmp.join("runs"), 1);
        sums.add("\"a\"".to_string(), i64::MAX).unwrap();
        sums.add("\"a\"".to_string(), 1).unwrap();
        assert_eq!(sums.runs.len(), 2);
        assert!(matches!(sums.finalize(), Err(FlowError::StepLogic(_))));
    }

    /* ============
       JOIN
       ============ */

    #[test]
    fn join_descarta_clave_derecha() {
        let params = json!({"left_key": "a1", "right_key": "b2"});
        let out = run(
            StepArtifact::native_with("join", params),
            vec![
                (0, rec(json!({"a1": 1, "a4": 10}))),
                (0, rec(json!({"a1": 2, "a4": 20}))),
                (1, rec(json!({"b2": 1, "b3": 99}))),
                (1, rec(json!({"b2": 3, "b3": 7}))),
            ],
        );
        assert_eq!(out, vec![json!({"a1": 1, "a4": 10, "b3": 99})]);
    }

    #[test]
    fn merge_records_respeta_campos_izquierda_y_prefija_derecha() {
        let left = json!({"id": "1", "name": "left"});
        let right = json!({"id": "1", "name": "right", "price": 10});
        let merged = merge_records(&left, &right, "id");
        assert_eq!(
            merged,
            json!({"id": "1", "name": "left", "right_name": "right", "price": 10})
        );
    }

    #[test]
    fn join_rechaza_tercera_entrada() {
        let reg = StepRegistry::with_builtins();
        let mut logic = reg.instantiate(&StepArtifact::native("join")).unwrap();
        let mut out = Vec::new();
        assert!(logic.process(2, rec(json!({"id": 1})), &mut out).is_err());
    }

    /* ============
       SORT
       ============ */

    #[test]
    fn sort_by_key_ordena_numeros_numericamente() {
        let out = run(
            StepArtifact::native_with("sort_by_key", json!({"key": "n"})),
            vec![
                (0, rec(json!({"n": 10}))),
                (0, rec(json!({"n": 9}))),
                (0, rec(json!({"n": 100}))),
            ],
        );
        assert_eq!(out, vec![json!({"n": 9}), json!({"n": 10}), json!({"n": 100})]);
    }

    #[test]
    fn compare_values_ordena_por_tipo() {
        assert_eq!(compare_values(&json!(null), &json!(1)), Ordering::Less);
        assert_eq!(compare_values(&json!("b"), &json!("a")), Ordering::Greater);
        assert_eq!(canonical_key(&json!(7)), canonical_key(&json!("7")));
    }
}
