use std::collections::BTreeMap;
use std::str::FromStr;

use serde_json::{json, Map as JsonMap, Value as JsonValue};

use crate::firestore::core::target::{Bound, Direction, FieldFilter, Operator, OrderBy, Target};
use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::local::target_data::TargetData;
use crate::firestore::model::{
    DatabaseId, Document, DocumentKey, FieldMask, FieldPath, FieldTransform, GeoPoint,
    MaybeDocument, Mutation, MutationKind, MutationResult, NoDocument, Precondition,
    ResourcePath, SnapshotVersion, Timestamp, TransformOperation,
};
use crate::firestore::value::{BytesValue, FirestoreValue, ObjectValue, ValueKind};

const SERVER_TIMESTAMP_TYPE_KEY: &str = "__type__";
const SERVER_TIMESTAMP_TYPE: &str = "server_timestamp";
const LOCAL_WRITE_TIME_KEY: &str = "__local_write_time__";
const PREVIOUS_VALUE_KEY: &str = "__previous_value__";

/// Converts model types to and from the JSON form of the Firestore v1 protos.
///
/// Reference values are stored as database-relative paths in the model and
/// expanded to fully qualified resource names on the wire.
#[derive(Clone, Debug)]
pub struct JsonProtoSerializer {
    database_id: DatabaseId,
}

impl JsonProtoSerializer {
    pub fn new(database_id: DatabaseId) -> Self {
        Self { database_id }
    }

    pub fn database_id(&self) -> &DatabaseId {
        &self.database_id
    }

    pub fn database_name(&self) -> String {
        format!(
            "projects/{}/databases/{}",
            self.database_id.project_id(),
            self.database_id.database()
        )
    }

    fn documents_root(&self) -> String {
        format!("{}/documents", self.database_name())
    }

    fn resource_name(&self, path: &ResourcePath) -> String {
        if path.is_empty() {
            self.documents_root()
        } else {
            format!("{}/{}", self.documents_root(), path.canonical_string())
        }
    }

    pub fn document_name(&self, key: &DocumentKey) -> String {
        self.resource_name(key.path())
    }

    /// Strips the `projects/{p}/databases/{d}/documents` prefix from `name`.
    fn decode_resource_path(&self, name: &str) -> FirestoreResult<ResourcePath> {
        let root = self.documents_root();
        if name == root {
            return Ok(ResourcePath::root());
        }
        let relative = name
            .strip_prefix(&root)
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or_else(|| {
                invalid_argument(format!(
                    "Resource name {name} does not belong to database {}",
                    self.database_name()
                ))
            })?;
        ResourcePath::from_string(relative)
    }

    pub fn decode_key(&self, name: &str) -> FirestoreResult<DocumentKey> {
        DocumentKey::from_path(self.decode_resource_path(name)?)
    }

    pub fn encode_version(&self, version: SnapshotVersion) -> JsonValue {
        JsonValue::String(version.timestamp().to_rfc3339())
    }

    /// Decodes a timestamp field; an absent value is the minimum version.
    pub fn decode_version(&self, value: Option<&JsonValue>) -> FirestoreResult<SnapshotVersion> {
        match value {
            None | Some(JsonValue::Null) => Ok(SnapshotVersion::min()),
            Some(value) => Ok(SnapshotVersion::new(decode_timestamp(value)?)),
        }
    }

    pub fn encode_bytes(&self, bytes: &BytesValue) -> JsonValue {
        JsonValue::String(bytes.to_base64())
    }

    pub fn decode_bytes(&self, value: Option<&JsonValue>) -> FirestoreResult<BytesValue> {
        match value {
            None | Some(JsonValue::Null) => Ok(BytesValue::empty()),
            Some(JsonValue::String(encoded)) => BytesValue::from_base64(encoded)
                .map_err(|err| invalid_argument(format!("Invalid bytes: {err}"))),
            Some(_) => Err(invalid_argument("Bytes must be a base64 string")),
        }
    }

    // Values

    pub fn encode_value(&self, value: &FirestoreValue) -> JsonValue {
        match value.kind() {
            ValueKind::Null => json!({ "nullValue": JsonValue::Null }),
            ValueKind::Boolean(boolean) => json!({ "booleanValue": boolean }),
            ValueKind::Integer(integer) => json!({ "integerValue": integer.to_string() }),
            ValueKind::Double(double) => json!({ "doubleValue": encode_double(*double) }),
            ValueKind::Timestamp(timestamp) => {
                json!({ "timestampValue": timestamp.to_rfc3339() })
            }
            ValueKind::ServerTimestamp {
                local_write_time,
                previous_value,
            } => {
                let mut fields = JsonMap::new();
                fields.insert(
                    SERVER_TIMESTAMP_TYPE_KEY.to_string(),
                    json!({ "stringValue": SERVER_TIMESTAMP_TYPE }),
                );
                fields.insert(
                    LOCAL_WRITE_TIME_KEY.to_string(),
                    json!({ "timestampValue": local_write_time.to_rfc3339() }),
                );
                if let Some(previous) = previous_value {
                    fields.insert(PREVIOUS_VALUE_KEY.to_string(), self.encode_value(previous));
                }
                json!({ "mapValue": { "fields": fields } })
            }
            ValueKind::String(string) => json!({ "stringValue": string }),
            ValueKind::Bytes(bytes) => json!({ "bytesValue": bytes.to_base64() }),
            ValueKind::Reference(path) => {
                let name = match ResourcePath::from_string(path) {
                    Ok(path) => self.resource_name(&path),
                    Err(_) => path.clone(),
                };
                json!({ "referenceValue": name })
            }
            ValueKind::GeoPoint(point) => json!({
                "geoPointValue": {
                    "latitude": point.latitude(),
                    "longitude": point.longitude(),
                }
            }),
            ValueKind::Array(array) => {
                let values: Vec<JsonValue> =
                    array.values().iter().map(|value| self.encode_value(value)).collect();
                json!({ "arrayValue": { "values": values } })
            }
            ValueKind::Map(map) => json!({
                "mapValue": { "fields": self.encode_fields(map.fields()) }
            }),
        }
    }

    pub fn encode_fields(&self, fields: &BTreeMap<String, FirestoreValue>) -> JsonValue {
        let mut encoded = JsonMap::new();
        for (key, value) in fields {
            encoded.insert(key.clone(), self.encode_value(value));
        }
        JsonValue::Object(encoded)
    }

    pub fn decode_fields(
        &self,
        value: Option<&JsonValue>,
    ) -> FirestoreResult<BTreeMap<String, FirestoreValue>> {
        let object = match value {
            None | Some(JsonValue::Null) => return Ok(BTreeMap::new()),
            Some(value) => value
                .as_object()
                .ok_or_else(|| invalid_argument("Expected 'fields' to be an object"))?,
        };
        let mut fields = BTreeMap::new();
        for (key, value) in object {
            fields.insert(key.clone(), self.decode_value(value)?);
        }
        Ok(fields)
    }

    pub fn decode_value(&self, value: &JsonValue) -> FirestoreResult<FirestoreValue> {
        let object = value
            .as_object()
            .ok_or_else(|| invalid_argument("Expected Firestore value object"))?;
        if object.contains_key("nullValue") {
            return Ok(FirestoreValue::null());
        }
        if let Some(bool_value) = object.get("booleanValue") {
            let value = bool_value
                .as_bool()
                .ok_or_else(|| invalid_argument("booleanValue must be bool"))?;
            return Ok(FirestoreValue::from_bool(value));
        }
        if let Some(integer_value) = object.get("integerValue") {
            let parsed = match integer_value {
                JsonValue::String(value) => i64::from_str(value)
                    .map_err(|err| invalid_argument(format!("Invalid integerValue: {err}")))?,
                JsonValue::Number(number) => number
                    .as_i64()
                    .ok_or_else(|| invalid_argument("Integer out of range"))?,
                _ => return Err(invalid_argument("integerValue must be a string or number")),
            };
            return Ok(FirestoreValue::from_integer(parsed));
        }
        if let Some(double_value) = object.get("doubleValue") {
            return Ok(FirestoreValue::from_double(decode_double(double_value)?));
        }
        if let Some(timestamp_value) = object.get("timestampValue") {
            return Ok(FirestoreValue::from_timestamp(decode_timestamp(
                timestamp_value,
            )?));
        }
        if let Some(string_value) = object.get("stringValue") {
            let value = string_value
                .as_str()
                .ok_or_else(|| invalid_argument("stringValue must be string"))?;
            return Ok(FirestoreValue::from_string(value));
        }
        if let Some(bytes_value) = object.get("bytesValue") {
            return Ok(FirestoreValue::from_bytes(
                self.decode_bytes(Some(bytes_value))?,
            ));
        }
        if let Some(reference_value) = object.get("referenceValue") {
            let name = reference_value
                .as_str()
                .ok_or_else(|| invalid_argument("referenceValue must be string"))?;
            let path = self.decode_resource_path(name)?;
            return Ok(FirestoreValue::from_reference(path.canonical_string()));
        }
        if let Some(geo_point) = object.get("geoPointValue") {
            let latitude = geo_point
                .get("latitude")
                .and_then(JsonValue::as_f64)
                .unwrap_or(0.0);
            let longitude = geo_point
                .get("longitude")
                .and_then(JsonValue::as_f64)
                .unwrap_or(0.0);
            return Ok(FirestoreValue::from_geo_point(GeoPoint::new(
                latitude, longitude,
            )?));
        }
        if let Some(array_value) = object.get("arrayValue") {
            let values = match array_value.get("values").and_then(JsonValue::as_array) {
                Some(entries) => entries
                    .iter()
                    .map(|entry| self.decode_value(entry))
                    .collect::<FirestoreResult<Vec<_>>>()?,
                None => Vec::new(),
            };
            return Ok(FirestoreValue::from_array(values));
        }
        if let Some(map_value) = object.get("mapValue") {
            let fields = self.decode_fields(map_value.get("fields"))?;
            return self.decode_map_or_server_timestamp(fields);
        }

        Err(invalid_argument("Unknown Firestore value type"))
    }

    fn decode_map_or_server_timestamp(
        &self,
        mut fields: BTreeMap<String, FirestoreValue>,
    ) -> FirestoreResult<FirestoreValue> {
        let is_server_timestamp = matches!(
            fields.get(SERVER_TIMESTAMP_TYPE_KEY).map(FirestoreValue::kind),
            Some(ValueKind::String(kind)) if kind == SERVER_TIMESTAMP_TYPE
        );
        if !is_server_timestamp {
            return Ok(FirestoreValue::from_map(fields));
        }
        let local_write_time = match fields.remove(LOCAL_WRITE_TIME_KEY).map(|v| v.into_kind()) {
            Some(ValueKind::Timestamp(time)) => time,
            _ => return Err(invalid_argument("Server timestamp without a local write time")),
        };
        Ok(FirestoreValue::server_timestamp(
            local_write_time,
            fields.remove(PREVIOUS_VALUE_KEY),
        ))
    }

    // Documents

    pub fn encode_document(&self, doc: &Document) -> JsonValue {
        json!({
            "name": self.document_name(doc.key()),
            "fields": self.encode_fields(doc.data().fields()),
            "updateTime": self.encode_version(doc.version()),
        })
    }

    /// Decodes a `Document` proto as sent by watch and lookups.
    pub fn decode_document(&self, value: &JsonValue) -> FirestoreResult<Document> {
        let name = value
            .get("name")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid_argument("Document is missing its name"))?;
        let key = self.decode_key(name)?;
        let update_time = value
            .get("updateTime")
            .ok_or_else(|| invalid_argument("Got a document without an update time"))?;
        let version = SnapshotVersion::new(decode_timestamp(update_time)?);
        let fields = self.decode_fields(value.get("fields"))?;
        Ok(Document::synced(key, version, ObjectValue::new(fields)))
    }

    /// Decodes one entry of a batch lookup response.
    pub fn decode_maybe_document(&self, value: &JsonValue) -> FirestoreResult<MaybeDocument> {
        if let Some(found) = value.get("found") {
            return Ok(self.decode_document(found)?.into());
        }
        if let Some(missing) = value.get("missing").and_then(JsonValue::as_str) {
            let key = self.decode_key(missing)?;
            let read_time = self.decode_version(value.get("readTime"))?;
            if read_time.is_min() {
                return Err(invalid_argument(
                    "Lookup reported a missing document without a read time",
                ));
            }
            return Ok(NoDocument::new(key, read_time, false).into());
        }
        Err(invalid_argument(
            "Lookup result has neither 'found' nor 'missing'",
        ))
    }

    // Mutations

    pub fn encode_mutation(&self, mutation: &Mutation) -> JsonValue {
        let name = self.document_name(mutation.key());
        let mut write = JsonMap::new();
        match mutation.kind() {
            MutationKind::Set { value } => {
                write.insert(
                    "update".to_string(),
                    json!({ "name": name, "fields": self.encode_fields(value.fields()) }),
                );
            }
            MutationKind::Patch { data, field_mask } => {
                write.insert(
                    "update".to_string(),
                    json!({ "name": name, "fields": self.encode_fields(data.fields()) }),
                );
                write.insert("updateMask".to_string(), encode_field_mask(field_mask));
            }
            MutationKind::Transform { field_transforms } => {
                let transforms: Vec<JsonValue> = field_transforms
                    .iter()
                    .map(|transform| self.encode_field_transform(transform))
                    .collect();
                write.insert(
                    "transform".to_string(),
                    json!({ "document": name, "fieldTransforms": transforms }),
                );
            }
            MutationKind::Delete => {
                write.insert("delete".to_string(), JsonValue::String(name));
            }
            MutationKind::Verify => {
                write.insert("verify".to_string(), JsonValue::String(name));
            }
        }
        if let Some(precondition) = self.encode_precondition(mutation.precondition()) {
            write.insert("currentDocument".to_string(), precondition);
        }
        JsonValue::Object(write)
    }

    pub fn decode_mutation(&self, value: &JsonValue) -> FirestoreResult<Mutation> {
        let precondition = self.decode_precondition(value.get("currentDocument"))?;
        if let Some(update) = value.get("update") {
            let name = update
                .get("name")
                .and_then(JsonValue::as_str)
                .ok_or_else(|| invalid_argument("Update write is missing its name"))?;
            let key = self.decode_key(name)?;
            let data = ObjectValue::new(self.decode_fields(update.get("fields"))?);
            return match value.get("updateMask") {
                Some(mask) => Ok(Mutation::patch(
                    key,
                    data,
                    decode_field_mask(mask)?,
                    precondition,
                )),
                None => Ok(Mutation::set_with_precondition(key, data, precondition)),
            };
        }
        if let Some(transform) = value.get("transform") {
            let name = transform
                .get("document")
                .and_then(JsonValue::as_str)
                .ok_or_else(|| invalid_argument("Transform write is missing its document"))?;
            let key = self.decode_key(name)?;
            let transforms = match transform.get("fieldTransforms").and_then(JsonValue::as_array)
            {
                Some(entries) => entries
                    .iter()
                    .map(|entry| self.decode_field_transform(entry))
                    .collect::<FirestoreResult<Vec<_>>>()?,
                None => Vec::new(),
            };
            return Ok(Mutation::transform(key, transforms));
        }
        if let Some(name) = value.get("delete").and_then(JsonValue::as_str) {
            return Ok(Mutation::delete(self.decode_key(name)?, precondition));
        }
        if let Some(name) = value.get("verify").and_then(JsonValue::as_str) {
            return Ok(Mutation::verify(self.decode_key(name)?, precondition));
        }
        Err(invalid_argument(format!("Unknown mutation: {value}")))
    }

    fn encode_precondition(&self, precondition: Precondition) -> Option<JsonValue> {
        match precondition {
            Precondition::None => None,
            Precondition::Exists(exists) => Some(json!({ "exists": exists })),
            Precondition::UpdateTime(version) => {
                Some(json!({ "updateTime": self.encode_version(version) }))
            }
        }
    }

    fn decode_precondition(&self, value: Option<&JsonValue>) -> FirestoreResult<Precondition> {
        let Some(value) = value else {
            return Ok(Precondition::None);
        };
        if let Some(exists) = value.get("exists").and_then(JsonValue::as_bool) {
            return Ok(Precondition::Exists(exists));
        }
        if let Some(update_time) = value.get("updateTime") {
            return Ok(Precondition::UpdateTime(SnapshotVersion::new(
                decode_timestamp(update_time)?,
            )));
        }
        Ok(Precondition::None)
    }

    fn encode_field_transform(&self, transform: &FieldTransform) -> JsonValue {
        let field_path = transform.field.canonical_string();
        match &transform.operation {
            TransformOperation::ServerTimestamp => json!({
                "fieldPath": field_path,
                "setToServerValue": "REQUEST_TIME",
            }),
            TransformOperation::ArrayUnion(elements) => json!({
                "fieldPath": field_path,
                "appendMissingElements": { "values": self.encode_values(elements) },
            }),
            TransformOperation::ArrayRemove(elements) => json!({
                "fieldPath": field_path,
                "removeAllFromArray": { "values": self.encode_values(elements) },
            }),
            TransformOperation::NumericIncrement(operand) => json!({
                "fieldPath": field_path,
                "increment": self.encode_value(operand),
            }),
        }
    }

    fn decode_field_transform(&self, value: &JsonValue) -> FirestoreResult<FieldTransform> {
        let path = value
            .get("fieldPath")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid_argument("Field transform is missing its path"))?;
        let field = FieldPath::from_server_format(path)?;
        let operation = if let Some(server_value) = value.get("setToServerValue") {
            if server_value.as_str() != Some("REQUEST_TIME") {
                return Err(invalid_argument(format!(
                    "Unknown server value transform {server_value}"
                )));
            }
            TransformOperation::ServerTimestamp
        } else if let Some(union) = value.get("appendMissingElements") {
            TransformOperation::ArrayUnion(self.decode_values(union.get("values"))?)
        } else if let Some(remove) = value.get("removeAllFromArray") {
            TransformOperation::ArrayRemove(self.decode_values(remove.get("values"))?)
        } else if let Some(operand) = value.get("increment") {
            TransformOperation::NumericIncrement(self.decode_value(operand)?)
        } else {
            return Err(invalid_argument(format!("Unknown field transform: {value}")));
        };
        Ok(FieldTransform::new(field, operation))
    }

    fn encode_values(&self, values: &[FirestoreValue]) -> Vec<JsonValue> {
        values.iter().map(|value| self.encode_value(value)).collect()
    }

    fn decode_values(&self, value: Option<&JsonValue>) -> FirestoreResult<Vec<FirestoreValue>> {
        match value.and_then(JsonValue::as_array) {
            Some(entries) => entries.iter().map(|entry| self.decode_value(entry)).collect(),
            None => Ok(Vec::new()),
        }
    }

    /// Decodes one `WriteResult`. Results without an update time (such as
    /// verifies and no-op deletes) were applied at `commit_version`.
    pub fn decode_write_result(
        &self,
        value: &JsonValue,
        commit_version: SnapshotVersion,
    ) -> FirestoreResult<MutationResult> {
        let mut version = self.decode_version(value.get("updateTime"))?;
        if version.is_min() {
            version = commit_version;
        }
        let transform_results = match value.get("transformResults").and_then(JsonValue::as_array)
        {
            Some(entries) => Some(
                entries
                    .iter()
                    .map(|entry| self.decode_value(entry))
                    .collect::<FirestoreResult<Vec<_>>>()?,
            ),
            None => None,
        };
        Ok(MutationResult::new(version, transform_results))
    }

    pub fn decode_write_results(
        &self,
        value: Option<&JsonValue>,
        commit_version: SnapshotVersion,
    ) -> FirestoreResult<Vec<MutationResult>> {
        match value.and_then(JsonValue::as_array) {
            Some(entries) => entries
                .iter()
                .map(|entry| self.decode_write_result(entry, commit_version))
                .collect(),
            None => Ok(Vec::new()),
        }
    }

    // Targets

    /// Body of a listen request's `addTarget`.
    pub fn encode_target(&self, target_data: &TargetData) -> JsonValue {
        let mut encoded = JsonMap::new();
        encoded.insert("targetId".to_string(), json!(target_data.target_id));
        if target_data.target.is_document_query() {
            encoded.insert(
                "documents".to_string(),
                self.encode_documents_target(&target_data.target),
            );
        } else {
            encoded.insert(
                "query".to_string(),
                self.encode_query_target(&target_data.target),
            );
        }
        if !target_data.resume_token.is_empty() {
            encoded.insert(
                "resumeToken".to_string(),
                self.encode_bytes(&target_data.resume_token),
            );
        } else if !target_data.snapshot_version.is_min() {
            encoded.insert(
                "readTime".to_string(),
                self.encode_version(target_data.snapshot_version),
            );
        }
        JsonValue::Object(encoded)
    }

    pub fn encode_documents_target(&self, target: &Target) -> JsonValue {
        json!({ "documents": [self.resource_name(&target.path)] })
    }

    pub fn decode_documents_target(&self, value: &JsonValue) -> FirestoreResult<Target> {
        let documents = value
            .get("documents")
            .and_then(JsonValue::as_array)
            .ok_or_else(|| invalid_argument("Documents target without documents"))?;
        if documents.len() != 1 {
            return Err(invalid_argument(format!(
                "Documents target expects exactly one document, got {}",
                documents.len()
            )));
        }
        let name = documents[0]
            .as_str()
            .ok_or_else(|| invalid_argument("Document name must be a string"))?;
        Ok(Target::for_document(&self.decode_key(name)?))
    }

    pub fn encode_query_target(&self, target: &Target) -> JsonValue {
        let mut structured_query = JsonMap::new();
        let parent = match &target.collection_group {
            Some(collection_id) => {
                structured_query.insert(
                    "from".to_string(),
                    json!([{ "collectionId": collection_id, "allDescendants": true }]),
                );
                self.resource_name(&target.path)
            }
            None => {
                let collection_id = target.path.last_segment().unwrap_or_default();
                structured_query.insert(
                    "from".to_string(),
                    json!([{ "collectionId": collection_id }]),
                );
                self.resource_name(&target.path.without_last())
            }
        };

        if let Some(filter) = self.encode_filters(&target.filters) {
            structured_query.insert("where".to_string(), filter);
        }
        if !target.order_by.is_empty() {
            let orders: Vec<JsonValue> = target.order_by.iter().map(encode_order_by).collect();
            structured_query.insert("orderBy".to_string(), JsonValue::Array(orders));
        }
        if let Some(limit) = target.limit {
            structured_query.insert("limit".to_string(), json!(limit));
        }
        if let Some(start_at) = &target.start_at {
            structured_query.insert("startAt".to_string(), self.encode_bound(start_at));
        }
        if let Some(end_at) = &target.end_at {
            structured_query.insert("endAt".to_string(), self.encode_bound(end_at));
        }

        json!({
            "parent": parent,
            "structuredQuery": structured_query,
        })
    }

    pub fn decode_query_target(&self, value: &JsonValue) -> FirestoreResult<Target> {
        let parent = value
            .get("parent")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid_argument("Query target without a parent"))?;
        let mut path = self.decode_resource_path(parent)?;
        let query = value
            .get("structuredQuery")
            .ok_or_else(|| invalid_argument("Query target without a structured query"))?;

        let from = query
            .get("from")
            .and_then(JsonValue::as_array)
            .ok_or_else(|| invalid_argument("Structured query without 'from'"))?;
        if from.len() != 1 {
            return Err(invalid_argument(
                "Only queries over a single collection are supported",
            ));
        }
        let collection_id = from[0]
            .get("collectionId")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid_argument("Collection selector without an id"))?;
        let all_descendants = from[0]
            .get("allDescendants")
            .and_then(JsonValue::as_bool)
            .unwrap_or(false);
        let collection_group = if all_descendants {
            Some(collection_id.to_string())
        } else {
            path = path.child([collection_id]);
            None
        };

        let filters = match query.get("where") {
            Some(filter) => self.decode_filters(filter)?,
            None => Vec::new(),
        };
        let order_by = match query.get("orderBy").and_then(JsonValue::as_array) {
            Some(orders) => orders
                .iter()
                .map(decode_order_by)
                .collect::<FirestoreResult<Vec<_>>>()?,
            None => Vec::new(),
        };
        let limit = match query.get("limit") {
            None | Some(JsonValue::Null) => None,
            Some(JsonValue::Number(number)) => number.as_i64(),
            Some(wrapper) => wrapper.get("value").and_then(JsonValue::as_i64),
        };
        let start_at = query
            .get("startAt")
            .map(|bound| self.decode_bound(bound))
            .transpose()?;
        let end_at = query
            .get("endAt")
            .map(|bound| self.decode_bound(bound))
            .transpose()?;

        Ok(Target {
            path,
            collection_group,
            order_by,
            filters,
            limit,
            start_at,
            end_at,
        })
    }

    fn encode_filters(&self, filters: &[FieldFilter]) -> Option<JsonValue> {
        match filters {
            [] => None,
            [filter] => Some(self.encode_filter(filter)),
            _ => {
                let encoded: Vec<JsonValue> =
                    filters.iter().map(|filter| self.encode_filter(filter)).collect();
                Some(json!({ "compositeFilter": { "op": "AND", "filters": encoded } }))
            }
        }
    }

    fn encode_filter(&self, filter: &FieldFilter) -> JsonValue {
        let field = json!({ "fieldPath": filter.field().canonical_string() });
        let unary = match filter.op() {
            Operator::Equal if filter.value().is_nan() => Some("IS_NAN"),
            Operator::Equal if filter.value().is_null() => Some("IS_NULL"),
            Operator::NotEqual if filter.value().is_nan() => Some("IS_NOT_NAN"),
            Operator::NotEqual if filter.value().is_null() => Some("IS_NOT_NULL"),
            _ => None,
        };
        match unary {
            Some(op) => json!({ "unaryFilter": { "field": field, "op": op } }),
            None => json!({
                "fieldFilter": {
                    "field": field,
                    "op": encode_operator(filter.op()),
                    "value": self.encode_value(filter.value()),
                }
            }),
        }
    }

    fn decode_filters(&self, value: &JsonValue) -> FirestoreResult<Vec<FieldFilter>> {
        if let Some(composite) = value.get("compositeFilter") {
            let op = composite.get("op").and_then(JsonValue::as_str).unwrap_or("AND");
            if op != "AND" {
                return Err(invalid_argument(format!("Unsupported composite filter {op}")));
            }
            let mut filters = Vec::new();
            if let Some(entries) = composite.get("filters").and_then(JsonValue::as_array) {
                for entry in entries {
                    filters.extend(self.decode_filters(entry)?);
                }
            }
            return Ok(filters);
        }
        if let Some(field_filter) = value.get("fieldFilter") {
            let field = decode_field_reference(field_filter.get("field"))?;
            let op = field_filter
                .get("op")
                .and_then(JsonValue::as_str)
                .ok_or_else(|| invalid_argument("Field filter without an operator"))?;
            let filter_value = field_filter
                .get("value")
                .ok_or_else(|| invalid_argument("Field filter without a value"))?;
            return Ok(vec![FieldFilter::new(
                field,
                decode_operator(op)?,
                self.decode_value(filter_value)?,
            )]);
        }
        if let Some(unary) = value.get("unaryFilter") {
            let field = decode_field_reference(unary.get("field"))?;
            let (op, operand) = match unary.get("op").and_then(JsonValue::as_str) {
                Some("IS_NAN") => (Operator::Equal, FirestoreValue::from_double(f64::NAN)),
                Some("IS_NULL") => (Operator::Equal, FirestoreValue::null()),
                Some("IS_NOT_NAN") => (Operator::NotEqual, FirestoreValue::from_double(f64::NAN)),
                Some("IS_NOT_NULL") => (Operator::NotEqual, FirestoreValue::null()),
                other => {
                    return Err(invalid_argument(format!(
                        "Unknown unary filter operator {other:?}"
                    )))
                }
            };
            return Ok(vec![FieldFilter::new(field, op, operand)]);
        }
        Err(invalid_argument(format!("Unknown filter: {value}")))
    }

    fn encode_bound(&self, bound: &Bound) -> JsonValue {
        json!({
            "values": self.encode_values(bound.position()),
            "before": bound.before(),
        })
    }

    fn decode_bound(&self, value: &JsonValue) -> FirestoreResult<Bound> {
        let before = value
            .get("before")
            .and_then(JsonValue::as_bool)
            .unwrap_or(false);
        Ok(Bound::new(self.decode_values(value.get("values"))?, before))
    }
}

fn encode_double(value: f64) -> JsonValue {
    if value.is_nan() {
        JsonValue::String("NaN".to_string())
    } else if value == f64::INFINITY {
        JsonValue::String("Infinity".to_string())
    } else if value == f64::NEG_INFINITY {
        JsonValue::String("-Infinity".to_string())
    } else {
        json!(value)
    }
}

fn decode_double(value: &JsonValue) -> FirestoreResult<f64> {
    match value {
        JsonValue::Number(number) => number
            .as_f64()
            .ok_or_else(|| invalid_argument("Invalid doubleValue")),
        JsonValue::String(text) => match text.as_str() {
            "NaN" => Ok(f64::NAN),
            "Infinity" => Ok(f64::INFINITY),
            "-Infinity" => Ok(f64::NEG_INFINITY),
            other => other
                .parse::<f64>()
                .map_err(|err| invalid_argument(format!("Invalid doubleValue: {err}"))),
        },
        _ => Err(invalid_argument("doubleValue must be a number or string")),
    }
}

fn decode_timestamp(value: &JsonValue) -> FirestoreResult<Timestamp> {
    match value {
        JsonValue::String(text) => Timestamp::parse_rfc3339(text),
        JsonValue::Object(object) => {
            let seconds = match object.get("seconds") {
                Some(JsonValue::String(seconds)) => i64::from_str(seconds)
                    .map_err(|err| invalid_argument(format!("Invalid seconds: {err}")))?,
                Some(JsonValue::Number(seconds)) => seconds.as_i64().unwrap_or(0),
                _ => 0,
            };
            let nanos = object.get("nanos").and_then(JsonValue::as_i64).unwrap_or(0);
            Ok(Timestamp::new(seconds, nanos as i32))
        }
        _ => Err(invalid_argument("Timestamp must be a string or object")),
    }
}

fn encode_field_mask(mask: &FieldMask) -> JsonValue {
    let paths: Vec<String> = mask.fields().iter().map(FieldPath::canonical_string).collect();
    json!({ "fieldPaths": paths })
}

fn decode_field_mask(value: &JsonValue) -> FirestoreResult<FieldMask> {
    let paths = match value.get("fieldPaths").and_then(JsonValue::as_array) {
        Some(paths) => paths
            .iter()
            .map(|path| {
                path.as_str()
                    .ok_or_else(|| invalid_argument("Field path must be a string"))
                    .and_then(FieldPath::from_server_format)
            })
            .collect::<FirestoreResult<Vec<_>>>()?,
        None => Vec::new(),
    };
    Ok(FieldMask::new(paths))
}

fn decode_field_reference(value: Option<&JsonValue>) -> FirestoreResult<FieldPath> {
    let path = value
        .and_then(|field| field.get("fieldPath"))
        .and_then(JsonValue::as_str)
        .ok_or_else(|| invalid_argument("Field reference without a path"))?;
    FieldPath::from_server_format(path)
}

fn encode_order_by(order_by: &OrderBy) -> JsonValue {
    let direction = match order_by.direction() {
        Direction::Ascending => "ASCENDING",
        Direction::Descending => "DESCENDING",
    };
    json!({
        "field": { "fieldPath": order_by.field().canonical_string() },
        "direction": direction,
    })
}

fn decode_order_by(value: &JsonValue) -> FirestoreResult<OrderBy> {
    let field = decode_field_reference(value.get("field"))?;
    let direction = match value.get("direction").and_then(JsonValue::as_str) {
        Some("DESCENDING") => Direction::Descending,
        _ => Direction::Ascending,
    };
    Ok(OrderBy::new(field, direction))
}

fn encode_operator(op: Operator) -> &'static str {
    match op {
        Operator::LessThan => "LESS_THAN",
        Operator::LessThanOrEqual => "LESS_THAN_OR_EQUAL",
        Operator::GreaterThan => "GREATER_THAN",
        Operator::GreaterThanOrEqual => "GREATER_THAN_OR_EQUAL",
        Operator::Equal => "EQUAL",
        Operator::NotEqual => "NOT_EQUAL",
        Operator::ArrayContains => "ARRAY_CONTAINS",
        Operator::In => "IN",
        Operator::ArrayContainsAny => "ARRAY_CONTAINS_ANY",
        Operator::NotIn => "NOT_IN",
    }
}

fn decode_operator(op: &str) -> FirestoreResult<Operator> {
    Ok(match op {
        "LESS_THAN" => Operator::LessThan,
        "LESS_THAN_OR_EQUAL" => Operator::LessThanOrEqual,
        "GREATER_THAN" => Operator::GreaterThan,
        "GREATER_THAN_OR_EQUAL" => Operator::GreaterThanOrEqual,
        "EQUAL" => Operator::Equal,
        "NOT_EQUAL" => Operator::NotEqual,
        "ARRAY_CONTAINS" => Operator::ArrayContains,
        "IN" => Operator::In,
        "ARRAY_CONTAINS_ANY" => Operator::ArrayContainsAny,
        "NOT_IN" => Operator::NotIn,
        other => return Err(invalid_argument(format!("Unknown filter operator {other}"))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::query::Query;
    use crate::firestore::local::target_data::TargetPurpose;

    fn serializer() -> JsonProtoSerializer {
        JsonProtoSerializer::new(DatabaseId::default("project"))
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn field(path: &str) -> FieldPath {
        FieldPath::from_dot_separated(path).unwrap()
    }

    #[test]
    fn document_names_include_the_database() {
        let serializer = serializer();
        let name = serializer.document_name(&key("rooms/eros"));
        assert_eq!(
            name,
            "projects/project/databases/(default)/documents/rooms/eros"
        );
        assert_eq!(serializer.decode_key(&name).unwrap(), key("rooms/eros"));
        assert!(serializer
            .decode_key("projects/other/databases/(default)/documents/rooms/eros")
            .is_err());
    }

    #[test]
    fn special_doubles_and_references_use_wire_forms() {
        let serializer = serializer();
        let nan = serializer.encode_value(&FirestoreValue::from_double(f64::NAN));
        assert_eq!(nan, json!({ "doubleValue": "NaN" }));
        assert!(serializer.decode_value(&nan).unwrap().is_nan());

        let infinity = serializer.encode_value(&FirestoreValue::from_double(f64::NEG_INFINITY));
        assert_eq!(infinity, json!({ "doubleValue": "-Infinity" }));

        let reference = FirestoreValue::from_reference("rooms/eros");
        let encoded = serializer.encode_value(&reference);
        assert_eq!(
            encoded,
            json!({ "referenceValue": "projects/project/databases/(default)/documents/rooms/eros" })
        );
        assert_eq!(serializer.decode_value(&encoded).unwrap(), reference);

        assert_eq!(
            serializer
                .decode_value(&json!({ "integerValue": "9007199254740993" }))
                .unwrap(),
            FirestoreValue::from_integer(9_007_199_254_740_993)
        );
    }

    #[test]
    fn server_timestamps_survive_encoding() {
        let serializer = serializer();
        let value = FirestoreValue::server_timestamp(
            Timestamp::new(100, 5),
            Some(FirestoreValue::from_integer(1)),
        );
        let encoded = serializer.encode_value(&value);
        assert_eq!(
            encoded["mapValue"]["fields"]["__type__"],
            json!({ "stringValue": "server_timestamp" })
        );
        assert_eq!(serializer.decode_value(&encoded).unwrap(), value);
    }

    #[test]
    fn patch_with_mask_and_precondition() {
        let serializer = serializer();
        let mut data = ObjectValue::empty();
        data.set(&field("a.b"), FirestoreValue::from_integer(1));
        let mutation = Mutation::patch(
            key("rooms/eros"),
            data,
            FieldMask::new(vec![field("a.b"), field("c")]),
            Precondition::Exists(true),
        );
        let encoded = serializer.encode_mutation(&mutation);
        assert_eq!(encoded["updateMask"], json!({ "fieldPaths": ["a.b", "c"] }));
        assert_eq!(encoded["currentDocument"], json!({ "exists": true }));
        assert_eq!(serializer.decode_mutation(&encoded).unwrap(), mutation);
    }

    #[test]
    fn transforms_delete_and_verify_writes() {
        let serializer = serializer();
        let transform = Mutation::transform(
            key("rooms/eros"),
            vec![
                FieldTransform::new(field("time"), TransformOperation::ServerTimestamp),
                FieldTransform::new(
                    field("count"),
                    TransformOperation::NumericIncrement(FirestoreValue::from_integer(2)),
                ),
            ],
        );
        let encoded = serializer.encode_mutation(&transform);
        assert_eq!(
            encoded["transform"]["fieldTransforms"][0],
            json!({ "fieldPath": "time", "setToServerValue": "REQUEST_TIME" })
        );
        assert_eq!(serializer.decode_mutation(&encoded).unwrap(), transform);

        let delete = Mutation::delete(key("rooms/eros"), Precondition::None);
        let encoded = serializer.encode_mutation(&delete);
        assert!(encoded.get("currentDocument").is_none());
        assert_eq!(serializer.decode_mutation(&encoded).unwrap(), delete);

        let verify = Mutation::verify(
            key("rooms/eros"),
            Precondition::UpdateTime(SnapshotVersion::from_micros(1_000_000)),
        );
        let encoded = serializer.encode_mutation(&verify);
        assert_eq!(serializer.decode_mutation(&encoded).unwrap(), verify);
    }

    #[test]
    fn write_results_fall_back_to_commit_time() {
        let serializer = serializer();
        let commit = SnapshotVersion::from_micros(5_000_000);
        let results = serializer
            .decode_write_results(
                Some(&json!([
                    { "updateTime": "1970-01-01T00:00:02Z" },
                    { "transformResults": [{ "integerValue": "3" }] },
                ])),
                commit,
            )
            .unwrap();
        assert_eq!(results[0].version, SnapshotVersion::from_micros(2_000_000));
        assert_eq!(results[1].version, commit);
        assert_eq!(
            results[1].transform_results,
            Some(vec![FirestoreValue::from_integer(3)])
        );
    }

    #[test]
    fn query_targets_decode_to_the_same_target() {
        let serializer = serializer();
        let query = Query::new(ResourcePath::from_string("rooms/eros/messages").unwrap())
            .with_filter(FieldFilter::new(
                field("score"),
                Operator::GreaterThan,
                FirestoreValue::from_integer(3),
            ))
            .with_filter(FieldFilter::new(
                field("tag"),
                Operator::Equal,
                FirestoreValue::null(),
            ))
            .with_order_by(OrderBy::new(field("score"), Direction::Descending))
            .with_limit_to_last(5)
            .with_start_at(Bound::new(vec![FirestoreValue::from_integer(10)], true));
        let target = query.to_target();

        let encoded = serializer.encode_query_target(&target);
        assert_eq!(
            encoded["parent"],
            json!("projects/project/databases/(default)/documents/rooms/eros")
        );
        assert_eq!(
            encoded["structuredQuery"]["where"]["compositeFilter"]["filters"][1],
            json!({ "unaryFilter": { "field": { "fieldPath": "tag" }, "op": "IS_NULL" } })
        );
        assert_eq!(serializer.decode_query_target(&encoded).unwrap(), target);
    }

    #[test]
    fn collection_group_and_document_targets() {
        let serializer = serializer();
        let group = Query::collection_group(ResourcePath::root(), "messages").to_target();
        let encoded = serializer.encode_query_target(&group);
        assert_eq!(
            encoded["structuredQuery"]["from"],
            json!([{ "collectionId": "messages", "allDescendants": true }])
        );
        assert_eq!(serializer.decode_query_target(&encoded).unwrap(), group);

        let document = Target::for_document(&key("rooms/eros"));
        let encoded = serializer.encode_documents_target(&document);
        assert_eq!(serializer.decode_documents_target(&encoded).unwrap(), document);
    }

    #[test]
    fn listen_targets_carry_resume_tokens() {
        let serializer = serializer();
        let target = Target::for_document(&key("rooms/eros"));
        let data = TargetData::new(target, 4, TargetPurpose::Listen, 1).with_resume_token(
            BytesValue::new(vec![1, 2, 3]),
            SnapshotVersion::from_micros(1_000_000),
        );
        let encoded = serializer.encode_target(&data);
        assert_eq!(encoded["targetId"], json!(4));
        assert_eq!(encoded["resumeToken"], json!("AQID"));
        assert!(encoded.get("readTime").is_none());
        assert!(encoded.get("documents").is_some());
    }

    #[test]
    fn lookups_decode_found_and_missing() {
        let serializer = serializer();
        let found = serializer
            .decode_maybe_document(&json!({
                "found": {
                    "name": "projects/project/databases/(default)/documents/rooms/eros",
                    "fields": { "name": { "stringValue": "Eros" } },
                    "updateTime": "1970-01-01T00:00:01Z",
                },
                "readTime": "1970-01-01T00:00:02Z",
            }))
            .unwrap();
        assert!(found.is_document());
        assert_eq!(found.version(), SnapshotVersion::from_micros(1_000_000));

        let missing = serializer
            .decode_maybe_document(&json!({
                "missing": "projects/project/databases/(default)/documents/rooms/none",
                "readTime": "1970-01-01T00:00:02Z",
            }))
            .unwrap();
        assert!(missing.is_no_document());
        assert_eq!(missing.version(), SnapshotVersion::from_micros(2_000_000));
    }
}
