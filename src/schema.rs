//! Postgres schema required by the adapter
//!
//! Run once against the self-hosted database (SQL editor, `psql`, or
//! `supabase-selfhost migrations apply`). Creates:
//! - the three edge function tables used by the REST record backend
//! - the migration ledger table
//! - the `execute_sql` procedure the SQL bridge calls, with its statement splitter
//! - the `deploy_edge_function` procedure that writes a definition and its files together

use crate::migrations::LEDGER_DDL;

const TABLES_DDL: &str = r#"
-- Edge function records
CREATE TABLE IF NOT EXISTS public.edge_functions (
    id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
    name TEXT NOT NULL UNIQUE,
    slug TEXT NOT NULL UNIQUE,
    status TEXT NOT NULL DEFAULT 'ACTIVE',
    version INTEGER NOT NULL DEFAULT 1 CHECK (version >= 1),
    entrypoint_path TEXT NOT NULL DEFAULT 'index.ts',
    import_map_path TEXT,
    verify_jwt BOOLEAN NOT NULL DEFAULT TRUE,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS public.edge_function_files (
    id BIGSERIAL PRIMARY KEY,
    function_id UUID NOT NULL REFERENCES public.edge_functions(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    content TEXT NOT NULL,
    UNIQUE (function_id, name)
);

CREATE TABLE IF NOT EXISTS public.edge_function_deployments (
    id BIGSERIAL PRIMARY KEY,
    function_id UUID NOT NULL REFERENCES public.edge_functions(id) ON DELETE CASCADE,
    version INTEGER NOT NULL,
    status TEXT NOT NULL,
    deployed_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    error_message TEXT
);

CREATE INDEX IF NOT EXISTS idx_edge_function_files_function ON public.edge_function_files(function_id);
CREATE INDEX IF NOT EXISTS idx_edge_function_deployments_function ON public.edge_function_deployments(function_id);
"#;

const POLICIES_DDL: &str = r#"
-- Only the service role may touch function records
ALTER TABLE public.edge_functions ENABLE ROW LEVEL SECURITY;
ALTER TABLE public.edge_function_files ENABLE ROW LEVEL SECURITY;
ALTER TABLE public.edge_function_deployments ENABLE ROW LEVEL SECURITY;

DROP POLICY IF EXISTS edge_functions_service_role ON public.edge_functions;
CREATE POLICY edge_functions_service_role ON public.edge_functions
    FOR ALL TO service_role USING (true) WITH CHECK (true);

DROP POLICY IF EXISTS edge_function_files_service_role ON public.edge_function_files;
CREATE POLICY edge_function_files_service_role ON public.edge_function_files
    FOR ALL TO service_role USING (true) WITH CHECK (true);

DROP POLICY IF EXISTS edge_function_deployments_service_role ON public.edge_function_deployments;
CREATE POLICY edge_function_deployments_service_role ON public.edge_function_deployments
    FOR ALL TO service_role USING (true) WITH CHECK (true);
"#;

const RPC_DDL: &str = r#"
-- Splits a script on top-level semicolons. Semicolons inside quoted strings,
-- quoted identifiers, comments and dollar-quoted bodies do not split.
-- Pieces holding only whitespace or comments are dropped.
CREATE OR REPLACE FUNCTION public.split_sql_statements(script TEXT)
RETURNS SETOF TEXT
LANGUAGE plpgsql
IMMUTABLE
AS $split$
DECLARE
    len INTEGER := length(script);
    i INTEGER := 1;
    start_at INTEGER := 1;
    ch TEXT;
    tag TEXT;
    close_at INTEGER;
    has_code BOOLEAN := FALSE;
BEGIN
    WHILE i <= len LOOP
        ch := substr(script, i, 1);
        IF ch = '''' OR ch = '"' THEN
            has_code := TRUE;
            i := i + 1;
            WHILE i <= len LOOP
                IF substr(script, i, 1) = ch THEN
                    -- Doubled quote is an escaped quote
                    IF substr(script, i + 1, 1) = ch THEN
                        i := i + 2;
                        CONTINUE;
                    END IF;
                    EXIT;
                END IF;
                i := i + 1;
            END LOOP;
            i := i + 1;
        ELSIF ch = '-' AND substr(script, i + 1, 1) = '-' THEN
            close_at := strpos(substr(script, i), E'\n');
            IF close_at = 0 THEN
                i := len + 1;
            ELSE
                i := i + close_at;
            END IF;
        ELSIF ch = '/' AND substr(script, i + 1, 1) = '*' THEN
            close_at := strpos(substr(script, i + 2), '*/');
            IF close_at = 0 THEN
                i := len + 1;
            ELSE
                i := i + close_at + 3;
            END IF;
        ELSIF ch = '$'
            AND (i = 1 OR substr(script, i - 1, 1) !~ '[A-Za-z0-9_]')
            AND substr(script, i) ~ '^\$([A-Za-z_][A-Za-z0-9_]*)?\$' THEN
            has_code := TRUE;
            tag := (regexp_match(substr(script, i), '^(\$([A-Za-z_][A-Za-z0-9_]*)?\$)'))[1];
            close_at := strpos(substr(script, i + length(tag)), tag);
            IF close_at = 0 THEN
                i := len + 1;
            ELSE
                i := i + length(tag) + close_at - 1 + length(tag);
            END IF;
        ELSIF ch = ';' THEN
            IF has_code THEN
                RETURN NEXT btrim(substr(script, start_at, i - start_at), E' \t\r\n');
            END IF;
            has_code := FALSE;
            i := i + 1;
            start_at := i;
        ELSE
            IF ch !~ '\s' THEN
                has_code := TRUE;
            END IF;
            i := i + 1;
        END IF;
    END LOOP;

    IF has_code THEN
        RETURN NEXT btrim(substr(script, start_at), E' \t\r\n');
    END IF;
    RETURN;
END;
$split$;

-- SQL bridge: runs each statement server-side and returns the rows of all of
-- them as one JSON array. Statements that return no rows add nothing.
-- Read-only calls take exactly one statement.
CREATE OR REPLACE FUNCTION public.execute_sql(query TEXT, read_only BOOLEAN DEFAULT FALSE)
RETURNS JSONB
LANGUAGE plpgsql
SECURITY DEFINER
SET search_path = public
AS $body$
DECLARE
    statements TEXT[] := ARRAY(SELECT public.split_sql_statements(query));
    stmt TEXT;
    rec RECORD;
    result JSONB := '[]'::jsonb;
BEGIN
    IF read_only THEN
        IF cardinality(statements) > 1 THEN
            RAISE EXCEPTION 'read-only queries must be a single statement'
                USING ERRCODE = 'feature_not_supported';
        END IF;
        PERFORM set_config('transaction_read_only', 'on', true);
    END IF;

    FOREACH stmt IN ARRAY statements LOOP
        BEGIN
            FOR rec IN EXECUTE stmt LOOP
                result := result || jsonb_build_array(to_jsonb(rec));
            END LOOP;
        EXCEPTION WHEN invalid_cursor_definition THEN
            -- Utility statements and DML without RETURNING cannot be iterated; nothing ran yet
            EXECUTE stmt;
        END;
    END LOOP;

    RETURN result;
END;
$body$;

-- Record store writes: the definition and its full file set change together.
-- A NULL expected_version creates. Otherwise the update applies only while the
-- stored version still matches, and PT409 reaches the caller as HTTP 409.
CREATE OR REPLACE FUNCTION public.deploy_edge_function(definition JSONB, expected_version INTEGER, files JSONB)
RETURNS SETOF public.edge_functions
LANGUAGE plpgsql
SET search_path = public
AS $deploy$
DECLARE
    saved public.edge_functions;
BEGIN
    IF expected_version IS NULL THEN
        INSERT INTO public.edge_functions
        SELECT * FROM jsonb_populate_record(NULL::public.edge_functions, definition)
        RETURNING * INTO saved;
    ELSE
        UPDATE public.edge_functions AS f SET
            status = d.status,
            version = d.version,
            entrypoint_path = d.entrypoint_path,
            import_map_path = d.import_map_path,
            verify_jwt = d.verify_jwt,
            updated_at = d.updated_at
        FROM jsonb_populate_record(NULL::public.edge_functions, definition) AS d
        WHERE f.id = d.id AND f.version = expected_version
        RETURNING f.* INTO saved;

        IF NOT FOUND THEN
            RAISE SQLSTATE 'PT409' USING MESSAGE = format(
                'function %s changed since version %s was read', definition->>'name', expected_version);
        END IF;

        DELETE FROM public.edge_function_files WHERE function_id = saved.id;
    END IF;

    INSERT INTO public.edge_function_files (function_id, name, content)
    SELECT saved.id, src.name, src.content
    FROM jsonb_to_recordset(files) AS src(name TEXT, content TEXT);

    RETURN NEXT saved;
END;
$deploy$;
"#;

const GRANTS_DDL: &str = r#"
REVOKE ALL ON FUNCTION public.execute_sql(TEXT, BOOLEAN) FROM PUBLIC, anon, authenticated;
GRANT EXECUTE ON FUNCTION public.execute_sql(TEXT, BOOLEAN) TO service_role;
REVOKE ALL ON FUNCTION public.deploy_edge_function(JSONB, INTEGER, JSONB) FROM PUBLIC, anon, authenticated;
GRANT EXECUTE ON FUNCTION public.deploy_edge_function(JSONB, INTEGER, JSONB) TO service_role;
"#;

/// Tables and procedures without the Supabase role setup, for plain Postgres
pub fn core_sql() -> String {
    format!(
        "{}\n-- Migration ledger\n{}\n{}",
        TABLES_DDL.trim_end(),
        LEDGER_DDL.trim(),
        RPC_DDL
    )
}

/// Full bootstrap script
pub fn schema_sql() -> String {
    format!(
        "-- supabase-selfhost schema\n{}\n{}\n{}",
        core_sql(),
        POLICIES_DDL.trim(),
        GRANTS_DDL.trim_start()
    )
}
