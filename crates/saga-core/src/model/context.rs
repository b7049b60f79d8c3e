//! Contexto de ejecución con ámbitos anidados.
//!
//! El ámbito raíz contiene los parámetros de arranque y lo que escriben los
//! mapeos de salida. Los bucles abren un ámbito hijo por iteración; las ramas
//! de un `Parallel` trabajan sobre un `fork` y se fusionan al terminar.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    scopes: Vec<IndexMap<String, Value>>,
}

impl Default for ExecutionContext {
    fn default() -> Self { Self { scopes: vec![IndexMap::new()] } }
}

impl ExecutionContext {
    pub fn new(params: IndexMap<String, Value>) -> Self { Self { scopes: vec![params] } }

    /// Contexto raíz desde un objeto JSON; cualquier otro valor da un contexto vacío.
    pub fn from_json(params: &Value) -> Self {
        let mut root = IndexMap::new();
        if let Value::Object(map) = params {
            for (k, v) in map {
                root.insert(k.clone(), v.clone());
            }
        }
        Self::new(root)
    }

    /// Busca la variable desde el ámbito más interno hacia el raíz.
    pub fn get(&self, name: &str) -> Option<&Value> { self.scopes.iter().rev().find_map(|s| s.get(name)) }

    /// Resuelve un path con puntos (`order.items.0.sku`): el primer segmento es
    /// la variable, el resto navega objetos y arrays.
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let head = segments.next()?;
        let root = self.get(head)?;
        navigate(root, segments)
    }

    /// Escribe en el ámbito más interno.
    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        if let Some(top) = self.scopes.last_mut() {
            top.insert(name.into(), value);
        }
    }

    pub fn push_scope(&mut self) { self.scopes.push(IndexMap::new()); }

    /// Cierra el ámbito más interno y devuelve sus variables. El raíz nunca se cierra.
    pub fn pop_scope(&mut self) -> IndexMap<String, Value> {
        if self.scopes.len() > 1 {
            self.scopes.pop().unwrap_or_default()
        } else {
            IndexMap::new()
        }
    }

    pub fn depth(&self) -> usize { self.scopes.len() }

    /// Copia aplanada con un ámbito local vacío encima: lo que escriba la rama
    /// queda en ese ámbito y se recupera con `into_local`.
    pub fn fork(&self) -> ExecutionContext {
        Self { scopes: vec![self.flatten(), IndexMap::new()] }
    }

    /// Variables escritas en el ámbito local de un fork.
    pub fn into_local(mut self) -> IndexMap<String, Value> {
        if self.scopes.len() > 1 {
            self.scopes.pop().unwrap_or_default()
        } else {
            IndexMap::new()
        }
    }

    /// Fusiona variables en el ámbito actual respetando el orden recibido.
    pub fn merge(&mut self, vars: IndexMap<String, Value>) {
        for (k, v) in vars {
            self.set(k, v);
        }
    }

    /// Vista plana: los ámbitos internos pisan a los externos.
    pub fn flatten(&self) -> IndexMap<String, Value> {
        let mut out = IndexMap::new();
        for scope in &self.scopes {
            for (k, v) in scope {
                out.insert(k.clone(), v.clone());
            }
        }
        out
    }

    pub fn to_json(&self) -> Value {
        let map: Map<String, Value> = self.flatten().into_iter().collect();
        Value::Object(map)
    }
}

/// Navega un valor JSON siguiendo segmentos de path.
pub fn navigate<'a, 'b>(root: &'a Value, segments: impl Iterator<Item = &'b str>) -> Option<&'a Value> {
    let mut current = root;
    for seg in segments {
        current = match current {
            Value::Object(map) => map.get(seg)?,
            Value::Array(items) => items.get(seg.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}
