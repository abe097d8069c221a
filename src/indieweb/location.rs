//! Consolidates scattered location microformat properties into one record.
//!
//! Follows the IndieWeb location-determination algorithm: collect candidate
//! property bags from the top level, `location`/`adr`, and `geo`, then take
//! the first non-empty value for each recognized property in push order.
//! https://indieweb.org/location#How_to_determine_the_location_of_a_microformat

use std::collections::HashMap;

use serde_json::Value;

use crate::micropub::normalize::Mf2Entry;

/// Recognized location property names, in result order. Keys here are
/// underscored; incoming microformat keys may still be hyphenated inside
/// nested objects and are normalized while scanning.
const LOCATION_PROPERTIES: &[&str] = &[
    "name",
    "street_address",
    "locality",
    "region",
    "country_name",
    "postal_code",
    "latitude",
    "longitude",
    "altitude",
];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocationData {
    pub name: Option<String>,
    pub street_address: Option<String>,
    pub locality: Option<String>,
    pub region: Option<String>,
    pub country_name: Option<String>,
    pub postal_code: Option<String>,
    pub latitude: Option<String>,
    pub longitude: Option<String>,
    pub altitude: Option<String>,
}

impl LocationData {
    pub fn is_empty(&self) -> bool {
        *self == LocationData::default()
    }

    /// The geo point, when both coordinates are present and parse.
    pub fn point(&self) -> Option<Point> {
        let latitude = self.latitude.as_ref()?.parse().ok()?;
        let longitude = self.longitude.as_ref()?.parse().ok()?;
        Some(Point {
            latitude,
            longitude,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub latitude: f64,
    pub longitude: f64,
}

/// Extract a consolidated location from an h-entry, or None when the entry
/// carries no location signal at all.
pub fn get_location(entry: &Mf2Entry) -> Option<LocationData> {
    let props = &entry.properties;

    // Candidate stack, in priority order: the top-level properties first,
    // then anything nested under location/adr, then geo.
    let mut stack: Vec<HashMap<String, Vec<Value>>> = vec![normalize_keys(props)];

    for prop in ["location", "adr"] {
        if let Some(first) = props.get(prop).and_then(|v| v.first()) {
            match first {
                // A bare string location is just a venue name.
                Value::String(s) => {
                    let mut frame = HashMap::new();
                    frame.insert("name".to_string(), vec![Value::String(s.clone())]);
                    stack.push(frame);
                }
                Value::Object(_) => stack.push(nested_properties(first)),
                _ => {}
            }
        }
    }

    if let Some(first) = props.get("geo").and_then(|v| v.first()) {
        match first {
            Value::Object(_) => stack.push(nested_properties(first)),
            Value::String(s) if s.starts_with("geo:") => {
                if let Some(frame) = parse_geo_uri(s) {
                    stack.push(frame);
                }
            }
            _ => {}
        }
    }

    let mut result = LocationData::default();
    for prop in LOCATION_PROPERTIES {
        for (idx, frame) in stack.iter().enumerate() {
            // The top-level `name` is the entry's own title, never the
            // location's.
            if idx == 0 && *prop == "name" {
                continue;
            }
            if let Some(value) = first_scalar(frame, prop) {
                set_field(&mut result, prop, value);
                break;
            }
        }
    }

    if result.is_empty() {
        None
    } else {
        Some(result)
    }
}

/// Parse a `geo:` URI per RFC 5870: `geo:lat,lon[,alt][;params]`.
fn parse_geo_uri(uri: &str) -> Option<HashMap<String, Vec<Value>>> {
    let body = uri.strip_prefix("geo:")?.split(';').next()?;
    let parts: Vec<&str> = body.split(',').collect();
    if parts.len() < 2 {
        return None;
    }
    let mut frame = HashMap::new();
    frame.insert(
        "latitude".to_string(),
        vec![Value::String(parts[0].to_string())],
    );
    frame.insert(
        "longitude".to_string(),
        vec![Value::String(parts[1].to_string())],
    );
    if parts.len() >= 3 {
        frame.insert(
            "altitude".to_string(),
            vec![Value::String(parts[2].to_string())],
        );
    }
    Some(frame)
}

fn nested_properties(value: &Value) -> HashMap<String, Vec<Value>> {
    let mut frame = HashMap::new();
    if let Some(props) = value.get("properties").and_then(|p| p.as_object()) {
        for (key, val) in props {
            let values = match val {
                Value::Array(list) => list.clone(),
                other => vec![other.clone()],
            };
            frame.insert(key.replace('-', "_"), values);
        }
    }
    frame
}

fn normalize_keys(props: &HashMap<String, Vec<Value>>) -> HashMap<String, Vec<Value>> {
    props
        .iter()
        .map(|(k, v)| (k.replace('-', "_"), v.clone()))
        .collect()
}

/// First value of a property as a non-empty string, accepting numbers too
/// (JSON latitude/longitude arrive as numbers).
fn first_scalar(frame: &HashMap<String, Vec<Value>>, key: &str) -> Option<String> {
    match frame.get(key)?.first()? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn set_field(result: &mut LocationData, prop: &str, value: String) {
    let field = match prop {
        "name" => &mut result.name,
        "street_address" => &mut result.street_address,
        "locality" => &mut result.locality,
        "region" => &mut result.region,
        "country_name" => &mut result.country_name,
        "postal_code" => &mut result.postal_code,
        "latitude" => &mut result.latitude,
        "longitude" => &mut result.longitude,
        "altitude" => &mut result.altitude,
        _ => return,
    };
    *field = Some(value);
}

/// GeoJSON coordinates are longitude/latitude (x, y) order.
/// refs: https://geojson.org/geojson-spec.html#id2
pub fn point_to_geojson(point: &Point) -> Value {
    serde_json::json!({
        "type": "Point",
        "coordinates": [point.longitude, point.latitude],
    })
}

pub fn geojson_to_point(value: &Value) -> Option<Point> {
    if value.get("type")?.as_str()? != "Point" {
        return None;
    }
    let coords = value.get("coordinates")?.as_array()?;
    Some(Point {
        longitude: coords.first()?.as_f64()?,
        latitude: coords.get(1)?.as_f64()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::micropub::normalize::normalize_json;
    use serde_json::json;

    fn entry(properties: Value) -> Mf2Entry {
        normalize_json(&json!({"type": ["h-entry"], "properties": properties})).unwrap()
    }

    #[test]
    fn no_location_signal_returns_none() {
        let e = entry(json!({"content": ["Hello"]}));
        assert!(get_location(&e).is_none());
    }

    #[test]
    fn bare_string_location_becomes_name() {
        let e = entry(json!({"location": ["Great Coffee Shop"]}));
        let loc = get_location(&e).unwrap();
        assert_eq!(loc.name.as_deref(), Some("Great Coffee Shop"));
    }

    #[test]
    fn structured_location_properties_are_collected() {
        let e = entry(json!({
            "location": [{
                "type": ["h-adr"],
                "properties": {
                    "street-address": ["1 Mountain Road"],
                    "locality": ["Hadano"],
                    "region": ["Kanagawa"],
                    "country-name": ["Japan"],
                    "postal-code": ["257-0000"],
                    "latitude": ["35.37"],
                    "longitude": ["139.22"]
                }
            }]
        }));
        let loc = get_location(&e).unwrap();
        assert_eq!(loc.street_address.as_deref(), Some("1 Mountain Road"));
        assert_eq!(loc.locality.as_deref(), Some("Hadano"));
        assert_eq!(loc.region.as_deref(), Some("Kanagawa"));
        assert_eq!(loc.country_name.as_deref(), Some("Japan"));
        assert_eq!(loc.postal_code.as_deref(), Some("257-0000"));
        assert_eq!(loc.latitude.as_deref(), Some("35.37"));
        assert_eq!(loc.longitude.as_deref(), Some("139.22"));
    }

    #[test]
    fn geo_uri_is_parsed() {
        let e = entry(json!({"geo": ["geo:35.37,139.22"]}));
        let loc = get_location(&e).unwrap();
        assert_eq!(loc.latitude.as_deref(), Some("35.37"));
        assert_eq!(loc.longitude.as_deref(), Some("139.22"));
        assert!(loc.altitude.is_none());
    }

    #[test]
    fn geo_uri_with_altitude_and_params() {
        let e = entry(json!({"geo": ["geo:35.37,139.22,120;u=35"]}));
        let loc = get_location(&e).unwrap();
        assert_eq!(loc.latitude.as_deref(), Some("35.37"));
        assert_eq!(loc.longitude.as_deref(), Some("139.22"));
        assert_eq!(loc.altitude.as_deref(), Some("120"));
    }

    #[test]
    fn geo_object_is_collected() {
        let e = entry(json!({
            "geo": [{
                "type": ["h-geo"],
                "properties": {"latitude": [35.37], "longitude": [139.22]}
            }]
        }));
        let loc = get_location(&e).unwrap();
        assert_eq!(loc.latitude.as_deref(), Some("35.37"));
        assert_eq!(loc.longitude.as_deref(), Some("139.22"));
    }

    #[test]
    fn top_level_name_is_never_the_location_name() {
        let e = entry(json!({
            "name": ["My Post Title"],
            "geo": ["geo:35.37,139.22"]
        }));
        let loc = get_location(&e).unwrap();
        assert!(loc.name.is_none());
    }

    #[test]
    fn nested_location_name_is_used() {
        let e = entry(json!({
            "name": ["My Post Title"],
            "location": [{
                "type": ["h-adr"],
                "properties": {"name": ["Mount Tanzawa"], "latitude": ["35.47"], "longitude": ["139.16"]}
            }]
        }));
        let loc = get_location(&e).unwrap();
        assert_eq!(loc.name.as_deref(), Some("Mount Tanzawa"));
    }

    #[test]
    fn earlier_candidates_win() {
        // Top-level latitude beats the geo URI's.
        let e = entry(json!({
            "latitude": ["1.0"],
            "geo": ["geo:2.0,3.0"]
        }));
        let loc = get_location(&e).unwrap();
        assert_eq!(loc.latitude.as_deref(), Some("1.0"));
        // Longitude only exists in the geo frame.
        assert_eq!(loc.longitude.as_deref(), Some("3.0"));
    }

    #[test]
    fn point_parses_from_strings() {
        let loc = LocationData {
            latitude: Some("35.37".into()),
            longitude: Some("139.22".into()),
            ..Default::default()
        };
        let point = loc.point().unwrap();
        assert_eq!(point.latitude, 35.37);
        assert_eq!(point.longitude, 139.22);
    }

    #[test]
    fn geojson_orders_coordinates_lon_lat() {
        let point = Point {
            latitude: 35.37,
            longitude: 139.22,
        };
        let geojson = point_to_geojson(&point);
        assert_eq!(geojson["coordinates"][0], json!(139.22));
        assert_eq!(geojson["coordinates"][1], json!(35.37));
    }

    #[test]
    fn geojson_round_trips() {
        let point = Point {
            latitude: -41.29,
            longitude: 174.78,
        };
        let back = geojson_to_point(&point_to_geojson(&point)).unwrap();
        assert_eq!(back, point);
    }

    #[test]
    fn geojson_rejects_non_points() {
        assert!(geojson_to_point(&json!({"type": "LineString", "coordinates": [[0, 0], [1, 1]]})).is_none());
    }
}
