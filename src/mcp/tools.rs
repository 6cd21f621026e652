//! The nine tool schemas exposed over the MCP surface (§4.1, §6).

use serde_json::json;

use super::protocol::ToolDefinition;

struct ToolSpec {
    name: &'static str,
    description: &'static str,
    schema: fn() -> serde_json::Value,
}

const TOOLS: &[ToolSpec] = &[
    ToolSpec {
        name: "store_memory",
        description: "Store a new memory with optional labels and source, returning its ID and the embedding used.",
        schema: store_memory_schema,
    },
    ToolSpec {
        name: "retrieve_memories",
        description: "Retrieve memories by semantic query and/or fuzzy label/source filters, ranked by similarity or recency.",
        schema: retrieve_memories_schema,
    },
    ToolSpec {
        name: "add_labels",
        description: "Append labels to an existing memory, preserving order and dropping exact duplicates.",
        schema: add_labels_schema,
    },
    ToolSpec {
        name: "del_labels",
        description: "Remove labels from an existing memory by exact, case-sensitive match.",
        schema: del_labels_schema,
    },
    ToolSpec {
        name: "delete_memory",
        description: "Delete a memory and every embedding row referencing it.",
        schema: delete_memory_schema,
    },
    ToolSpec {
        name: "get_memory",
        description: "Fetch a single memory by ID.",
        schema: get_memory_schema,
    },
    ToolSpec {
        name: "random_memory",
        description: "Fetch one memory at random, optionally filtered by label or source.",
        schema: random_memory_schema,
    },
    ToolSpec {
        name: "memory_stats",
        description: "Return memory counts, optionally filtered by label or source.",
        schema: memory_stats_schema,
    },
    ToolSpec {
        name: "trending_labels",
        description: "Return the top labels by decayed, recency-weighted usage within a day window.",
        schema: trending_labels_schema,
    },
];

fn store_memory_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "content": {"type": "string", "description": "Text to remember. May also be a JSON object literal carrying content/labels/source, which overrides the sibling parameters."},
            "labels": {"type": "string", "description": "Comma-separated labels."},
            "source": {"type": "string", "description": "Short string identifying the producer."}
        },
        "required": ["content"]
    })
}

fn retrieve_memories_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "query": {"type": "string", "description": "Free text. When present triggers semantic search; when absent, memories are listed by recency. May also be a JSON object literal carrying query/labels/source."},
            "labels": {"type": "string", "description": "Comma-separated labels, leading '!' excludes."},
            "source": {"type": "string", "description": "Fuzzy source match, leading '!' inverts."},
            "num_results": {"type": "integer", "default": 5, "description": "Maximum number of memories to return."}
        }
    })
}

fn add_labels_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "memory_id": {"type": "integer", "description": "ID of the memory to modify."},
            "labels": {"description": "Labels to add, as a JSON array of strings or a comma-separated string."}
        },
        "required": ["memory_id", "labels"]
    })
}

fn del_labels_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "memory_id": {"type": "integer", "description": "ID of the memory to modify."},
            "labels": {"description": "Labels to remove, as a JSON array of strings or a comma-separated string."}
        },
        "required": ["memory_id", "labels"]
    })
}

fn delete_memory_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "memory_id": {"type": "integer", "description": "ID of the memory to delete."}
        },
        "required": ["memory_id"]
    })
}

fn get_memory_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "memory_id": {"type": "integer", "description": "ID of the memory to fetch."}
        },
        "required": ["memory_id"]
    })
}

fn random_memory_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "labels": {"type": "string", "description": "Comma-separated labels, leading '!' excludes."},
            "source": {"type": "string", "description": "Fuzzy source match, leading '!' inverts."}
        }
    })
}

fn memory_stats_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "labels": {"type": "string", "description": "Comma-separated labels, leading '!' excludes."},
            "source": {"type": "string", "description": "Fuzzy source match, leading '!' inverts."}
        }
    })
}

fn trending_labels_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "days": {"type": "integer", "default": 30, "description": "Window, in days, over which to score label tokens."},
            "limit": {"type": "integer", "default": 10, "description": "Maximum number of trending labels to return."}
        }
    })
}

pub fn get_tool_definitions() -> Vec<ToolDefinition> {
    TOOLS
        .iter()
        .map(|t| ToolDefinition {
            name: t.name.to_string(),
            description: t.description.to_string(),
            input_schema: (t.schema)(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defines_all_nine_tools() {
        let defs = get_tool_definitions();
        assert_eq!(defs.len(), 9);
        let names: Vec<&str> = defs.iter().map(|d| d.name.as_str()).collect();
        assert!(names.contains(&"store_memory"));
        assert!(names.contains(&"trending_labels"));
    }

    #[test]
    fn every_schema_is_an_object_type() {
        for def in get_tool_definitions() {
            assert_eq!(def.input_schema["type"], "object");
        }
    }
}
