//! Hardware information refresh.
//!
//! Collected once at startup from the in-server procfs functions. The
//! repository insert is conditional: a new row appears only when the cpu
//! or memory tuple differs from the most recent one for this instance.

use anyhow::Result;
use tokio_postgres::Client;

use crate::db::TextRows;

pub const SELECT_CPUINFO: &str = "\
SELECT \
  vendor_id, model_name, cpu_mhz, processors, \
  threads_per_core, cores_per_socket, sockets \
FROM statsinfo.cpuinfo()";

pub const SELECT_MEMINFO: &str = "SELECT mem_total FROM statsinfo.meminfo()";

const SQL_INSERT_CPUINFO: &str = "\
WITH \
  ic (vendor_id, model_name, cpu_mhz, processors, threads_per_core, cores_per_socket, sockets) \
    AS (VALUES ($2::text, $3::text, $4::text::real, $5::text::integer, \
                $6::text::integer, $7::text::integer, $8::text::integer)), \
  r1 AS ( \
    SELECT ic.vendor_id, ic.model_name, ic.processors, ic.sockets FROM ic ), \
  r2 AS ( \
    SELECT rc.vendor_id, rc.model_name, rc.processors, rc.sockets FROM statsrepo.cpuinfo rc \
    WHERE instid = $1 \
      AND timestamp = (SELECT pg_catalog.max(timestamp) FROM statsrepo.cpuinfo WHERE instid = $1) ) \
INSERT INTO statsrepo.cpuinfo \
  (instid, timestamp, vendor_id, model_name, cpu_mhz, \
   processors, threads_per_core, cores_per_socket, sockets) \
SELECT $1, pg_catalog.transaction_timestamp(), t.vendor_id, t.model_name, \
       ic.cpu_mhz, t.processors, ic.threads_per_core, ic.cores_per_socket, t.sockets \
FROM (SELECT * FROM r1 EXCEPT SELECT * FROM r2) t, ic";

const SQL_INSERT_MEMINFO: &str = "\
WITH \
  r1 (mem_total) AS (VALUES ($2::text::bigint)), \
  r2 AS ( \
    SELECT rm.mem_total FROM statsrepo.meminfo rm \
    WHERE instid = $1 \
      AND timestamp = (SELECT pg_catalog.max(timestamp) FROM statsrepo.meminfo WHERE instid = $1) ) \
INSERT INTO statsrepo.meminfo (instid, timestamp, mem_total) \
SELECT $1, pg_catalog.transaction_timestamp(), t.mem_total \
FROM (SELECT * FROM r1 EXCEPT SELECT * FROM r2) t";

pub struct HardwareInfo {
    pub cpuinfo: TextRows,
    pub meminfo: TextRows,
}

impl HardwareInfo {
    pub async fn execute(&self, client: &Client, instid: i64) -> Result<()> {
        client.batch_execute("BEGIN").await?;
        let result = self.write(client, instid).await;
        match result {
            Ok(()) => {
                client.batch_execute("COMMIT").await?;
                Ok(())
            }
            Err(e) => {
                let _ = client.batch_execute("ROLLBACK").await;
                Err(e)
            }
        }
    }

    async fn write(&self, client: &Client, instid: i64) -> Result<()> {
        if let Some(cpu) = self.cpuinfo.first() {
            let value = |i: usize| cpu.get(i).cloned().flatten();
            client
                .execute(
                    SQL_INSERT_CPUINFO,
                    &[
                        &instid,
                        &value(0),
                        &value(1),
                        &value(2),
                        &value(3),
                        &value(4),
                        &value(5),
                        &value(6),
                    ],
                )
                .await?;
        }

        if let Some(mem) = self.meminfo.first() {
            client
                .execute(SQL_INSERT_MEMINFO, &[&instid, &mem.first().cloned().flatten()])
                .await?;
        }
        Ok(())
    }
}
